//! Store-neutral descriptions of collections, indexes, queries and updates.
//!
//! The MongoDB backend renders these into BSON, the in-memory backend evaluates them directly
//! against [`AdRecord`]s.

use std::cmp::Ordering;
use std::fmt;

use mongodb::bson::{DateTime, Document, doc};

use crate::document::AdRecord;

/// Upper bound on the records materialized by a single read.
pub const DEFAULT_READ_LIMIT: usize = 10_000;

/// Physical layout of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionLayout {
    /// A regular collection; documents are stored apart from their indexes.
    Plain,
    /// Documents are stored in the order of a unique clustered index on `_id`.
    Clustered,
    /// A time-series collection bucketed by `meta_field` over `time_field`.
    TimeSeries {
        /// Field holding the measurement time.
        time_field: String,
        /// Field identifying the series.
        meta_field: String,
    },
}

/// Direction of an index key or a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    /// Smallest value first (`1`).
    Ascending,
    /// Largest value first (`-1`).
    Descending,
}

impl SortOrder {
    /// Converts the numeric form used in index definitions.
    pub fn from_i32(order: i32) -> Option<Self> {
        match order {
            1 => Some(Self::Ascending),
            -1 => Some(Self::Descending),
            _ => None,
        }
    }

    /// The numeric form understood by the server.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }
}

/// A validated index: a name and its ordered key fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeys {
    /// Name of the index.
    pub name: String,
    /// Fields in key order.
    pub keys: Vec<(String, SortOrder)>,
}

impl IndexKeys {
    /// The index key document, e.g. `{ deviceId: 1, timeStamp: 1 }`.
    pub fn to_document(&self) -> Document {
        let mut keys = Document::new();
        for (field, order) in &self.keys {
            keys.insert(field.as_str(), order.as_i32());
        }
        keys
    }
}

/// Fields records can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// The primary key `_id`.
    PrimaryKey,
    /// `deviceId`.
    DeviceId,
    /// `timeStamp`.
    Timestamp,
}

impl SortKey {
    /// The field name on the wire.
    pub fn field(self) -> &'static str {
        match self {
            Self::PrimaryKey => "_id",
            Self::DeviceId => "deviceId",
            Self::Timestamp => "timeStamp",
        }
    }

    /// Compares two records by this key.
    ///
    /// Returns `None` for [`SortKey::PrimaryKey`], whose order is owned by the store.
    pub fn compare(self, a: &AdRecord, b: &AdRecord) -> Option<Ordering> {
        match self {
            Self::PrimaryKey => None,
            Self::DeviceId => Some(a.device_id.cmp(&b.device_id)),
            Self::Timestamp => Some(a.timestamp.cmp(&b.timestamp)),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Selects records by device and creation time.
///
/// Unset criteria match everything. The time range includes `from` and excludes `to`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Match this device only.
    pub device_id: Option<i64>,
    /// Earliest `timeStamp` to match.
    pub from: Option<DateTime>,
    /// First `timeStamp` no longer matched.
    pub to: Option<DateTime>,
}

impl RecordFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches records of `device_id` created within `[from, to)`.
    pub fn device_in_range(device_id: i64, from: DateTime, to: DateTime) -> Self {
        Self {
            device_id: Some(device_id),
            from: Some(from),
            to: Some(to),
        }
    }

    /// Whether the record satisfies every set criterion.
    pub fn matches(&self, record: &AdRecord) -> bool {
        self.device_id.is_none_or(|id| record.device_id == id)
            && self.from.is_none_or(|from| record.timestamp >= from)
            && self.to.is_none_or(|to| record.timestamp < to)
    }

    /// The query filter document.
    pub fn to_document(&self) -> Document {
        let mut filter = Document::new();
        if let Some(device_id) = self.device_id {
            filter.insert("deviceId", device_id);
        }

        let mut range = Document::new();
        if let Some(from) = self.from {
            range.insert("$gte", from);
        }
        if let Some(to) = self.to {
            range.insert("$lt", to);
        }
        if !range.is_empty() {
            filter.insert("timeStamp", range);
        }

        filter
    }
}

/// A bounded read.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    /// Which records to return.
    pub filter: RecordFilter,
    /// Optional ordering of the results.
    pub sort: Option<(SortKey, SortOrder)>,
    /// Maximum number of records to return.
    pub limit: usize,
}

impl FindQuery {
    /// Creates an unsorted query.
    pub fn new(filter: RecordFilter, limit: usize) -> Self {
        Self {
            filter,
            sort: None,
            limit,
        }
    }

    /// Orders the results by `key`.
    pub fn sorted(mut self, key: SortKey, order: SortOrder) -> Self {
        self.sort = Some((key, order));
        self
    }

    /// The sort document, if the query is sorted.
    pub fn sort_document(&self) -> Option<Document> {
        self.sort.map(|(key, order)| {
            let mut sort = Document::new();
            sort.insert(key.field(), order.as_i32());
            sort
        })
    }
}

/// Values to set on every matched record. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    /// New `deviceId`.
    pub device_id: Option<i64>,
    /// New `tMsgRecvByServer`.
    pub msg_received_by_server: Option<i64>,
    /// New `audioPlayed`.
    pub audio_played: Option<i32>,
}

impl RecordUpdate {
    /// Whether the update would not set anything.
    pub fn is_empty(&self) -> bool {
        self.device_id.is_none()
            && self.msg_received_by_server.is_none()
            && self.audio_played.is_none()
    }

    /// Applies the update, returning whether any value changed.
    pub fn apply(&self, record: &mut AdRecord) -> bool {
        let mut changed = false;
        if let Some(device_id) = self.device_id {
            changed |= std::mem::replace(&mut record.device_id, device_id) != device_id;
        }
        if let Some(received) = self.msg_received_by_server {
            changed |= std::mem::replace(&mut record.msg_received_by_server, received) != received;
        }
        if let Some(played) = self.audio_played {
            changed |= std::mem::replace(&mut record.audio_played, played) != played;
        }
        changed
    }

    /// The update document, `{ $set: { ... } }`.
    pub fn to_document(&self) -> Document {
        let mut set = Document::new();
        if let Some(device_id) = self.device_id {
            set.insert("deviceId", device_id);
        }
        if let Some(received) = self.msg_received_by_server {
            set.insert("tMsgRecvByServer", received);
        }
        if let Some(played) = self.audio_played {
            set.insert("audioPlayed", played);
        }
        doc! { "$set": set }
    }
}

/// Outcome of an `update_many`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Records matched by the filter.
    pub matched: u64,
    /// Records whose stored values changed. Never larger than `matched`.
    pub modified: u64,
}

/// How often an index has been used since the server started tracking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexUsage {
    /// Name of the index.
    pub name: String,
    /// Operations that used the index.
    pub accesses: u64,
}

/// Execution statistics of a query, as reported by `explain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    /// Innermost stage of the winning plan, e.g. `IXSCAN` or `COLLSCAN`.
    pub stage: String,
    /// Index the winning plan scans, if any.
    pub index: Option<String>,
    /// Index keys examined.
    pub keys_examined: u64,
    /// Documents examined.
    pub docs_examined: u64,
    /// Documents returned.
    pub returned: u64,
}

impl QueryPlan {
    /// Whether the query was answered without an index.
    pub fn is_collection_scan(&self) -> bool {
        self.index.is_none()
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stage)?;
        if let Some(index) = &self.index {
            write!(f, " on {index}")?;
        }
        write!(
            f,
            " ({} keys, {} docs examined, {} returned)",
            self.keys_examined, self.docs_examined, self.returned
        )
    }
}

/// Replica set membership as reported by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSetStatus {
    /// Name of the replica set.
    pub set_name: Option<String>,
    /// Address of the current primary, if there is one.
    pub primary: Option<String>,
    /// Addresses of all secondaries.
    pub secondaries: Vec<String>,
}
