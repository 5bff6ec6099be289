//! Storage strategies: how the benchmark's collection is laid out and accessed.

use std::fmt;
use std::str::FromStr;

use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

use crate::backend::DocumentStore;
use crate::document::AdRecord;
use crate::error::{ConfigError, Result, StoreResult};
use crate::query::{
    CollectionLayout, DEFAULT_READ_LIMIT, FindQuery, IndexKeys, IndexUsage, QueryPlan,
    RecordFilter, RecordUpdate, SortKey, SortOrder, UpdateOutcome,
};

/// Field holding the creation time of a record.
pub const TIME_FIELD: &str = "timeStamp";
/// Field identifying the device a record belongs to.
pub const DEVICE_FIELD: &str = "deviceId";

/// The available storage strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Records stored in `_id` order through a clustered index.
    Clustered,
    /// A regular collection with secondary indexes.
    #[default]
    #[serde(alias = "non-clustered")]
    Secondary,
    /// A time-series collection.
    TimeSeries,
}

impl StrategyKind {
    /// The collection used when none is configured.
    pub fn default_collection(self) -> &'static str {
        match self {
            Self::Clustered => "AdvertisementHistoryMDBClustered",
            Self::Secondary => "AdvertisementHistoryMDB",
            Self::TimeSeries => "AdvertisementHistoryMDBTimeSeries",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clustered => "clustered",
            Self::Secondary => "secondary",
            Self::TimeSeries => "timeseries",
        };
        f.write_str(name)
    }
}

/// The strategy name parse error.
#[derive(Clone, Debug)]
pub struct StrategyParseError(String);

impl fmt::Display for StrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as strategy: expected one of "clustered", "secondary", "timeseries""#,
            self.0
        )
    }
}

impl std::error::Error for StrategyParseError {}

impl FromStr for StrategyKind {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "clustered" | "c" => Self::Clustered,
            "secondary" | "non-clustered" | "nonclustered" => Self::Secondary,
            "timeseries" | "time-series" | "ts" => Self::TimeSeries,
            _ => return Err(StrategyParseError(s.into())),
        };
        Ok(kind)
    }
}

/// An unvalidated index definition, as it appears in configuration.
///
/// `fields` and `orders` are parallel lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Name of the index.
    pub name: String,
    /// Indexed fields, in key order.
    pub fields: Vec<String>,
    /// Sort order per field, `1` or `-1`.
    pub orders: Vec<i32>,
}

impl IndexDefinition {
    /// Creates a definition from parallel field and order lists.
    pub fn new(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
        orders: impl IntoIterator<Item = i32>,
    ) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            orders: orders.into_iter().collect(),
        }
    }

    /// Checks the definition and turns it into index keys.
    pub fn validate(&self) -> Result<IndexKeys, ConfigError> {
        if self.fields.len() != self.orders.len() {
            return Err(ConfigError::MismatchedIndex {
                name: self.name.clone(),
                fields: self.fields.len(),
                orders: self.orders.len(),
            });
        }
        if self.fields.is_empty() {
            return Err(ConfigError::EmptyIndex {
                name: self.name.clone(),
            });
        }

        let keys = self
            .fields
            .iter()
            .zip(&self.orders)
            .map(|(field, &order)| {
                let order = SortOrder::from_i32(order).ok_or_else(|| {
                    ConfigError::InvalidSortOrder {
                        name: self.name.clone(),
                        field: field.clone(),
                        order,
                    }
                })?;
                Ok((field.clone(), order))
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(IndexKeys {
            name: self.name.clone(),
            keys,
        })
    }
}

/// The secondary indexes created when none are configured.
pub fn default_indexes() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::new(
            "deviceId_1_timeStamp_1",
            [DEVICE_FIELD, TIME_FIELD],
            [1, 1],
        ),
        IndexDefinition::new("reqRefNo_1", ["reqRefNo"], [1]),
    ]
}

/// How records are stored and read for one benchmark run.
///
/// A strategy is fixed once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageStrategy {
    /// Records in a collection clustered on `_id`.
    Clustered {
        /// Target collection.
        collection: String,
    },
    /// Records in a regular collection with secondary indexes.
    SecondaryIndexed {
        /// Target collection.
        collection: String,
        /// Indexes created by [`StorageStrategy::ensure_schema`].
        indexes: Vec<IndexDefinition>,
    },
    /// Records in a time-series collection keyed by device.
    TimeSeries {
        /// Target collection.
        collection: String,
    },
}

impl StorageStrategy {
    /// Creates a strategy of the given kind.
    ///
    /// `indexes` are only used by [`StrategyKind::Secondary`].
    pub fn new(
        kind: StrategyKind,
        collection: Option<String>,
        indexes: Vec<IndexDefinition>,
    ) -> Self {
        let collection = collection.unwrap_or_else(|| kind.default_collection().to_owned());
        match kind {
            StrategyKind::Clustered => Self::Clustered { collection },
            StrategyKind::Secondary => Self::SecondaryIndexed {
                collection,
                indexes,
            },
            StrategyKind::TimeSeries => Self::TimeSeries { collection },
        }
    }

    /// The kind of this strategy.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Clustered { .. } => StrategyKind::Clustered,
            Self::SecondaryIndexed { .. } => StrategyKind::Secondary,
            Self::TimeSeries { .. } => StrategyKind::TimeSeries,
        }
    }

    /// The collection records are written to.
    pub fn collection(&self) -> &str {
        match self {
            Self::Clustered { collection }
            | Self::SecondaryIndexed { collection, .. }
            | Self::TimeSeries { collection } => collection,
        }
    }

    /// The layout of the target collection.
    pub fn layout(&self) -> CollectionLayout {
        match self {
            Self::Clustered { .. } => CollectionLayout::Clustered,
            Self::SecondaryIndexed { .. } => CollectionLayout::Plain,
            Self::TimeSeries { .. } => CollectionLayout::TimeSeries {
                time_field: TIME_FIELD.to_owned(),
                meta_field: DEVICE_FIELD.to_owned(),
            },
        }
    }

    /// The non-primary key used by sorted read benchmarks.
    pub fn secondary_sort_key(&self) -> SortKey {
        SortKey::DeviceId
    }

    /// Validates the index definitions without touching a store.
    pub fn validate(&self) -> Result<Vec<IndexKeys>, ConfigError> {
        match self {
            Self::SecondaryIndexed { indexes, .. } => {
                indexes.iter().map(IndexDefinition::validate).collect()
            }
            Self::Clustered { .. } | Self::TimeSeries { .. } => Ok(Vec::new()),
        }
    }

    /// Creates the target collection and its indexes, returning the created index names.
    ///
    /// All index definitions are validated before the store is contacted. Running this against an
    /// existing schema is a no-op.
    pub async fn ensure_schema(&self, store: &dyn DocumentStore) -> Result<Vec<String>> {
        let indexes = self.validate()?;

        store
            .create_collection(self.collection(), &self.layout())
            .await?;

        if indexes.is_empty() {
            return Ok(Vec::new());
        }

        let names = store.create_indexes(self.collection(), &indexes).await?;
        tracing::info!(collection = self.collection(), ?names, "created indexes");
        Ok(names)
    }

    /// Writes one record.
    pub async fn insert(&self, store: &dyn DocumentStore, record: &AdRecord) -> StoreResult<()> {
        store.insert_one(self.collection(), record).await
    }

    /// Reads up to `limit` records in no particular order.
    pub async fn find_all(
        &self,
        store: &dyn DocumentStore,
        limit: usize,
    ) -> StoreResult<Vec<AdRecord>> {
        let query = FindQuery::new(RecordFilter::all(), limit);
        store.find(self.collection(), &query).await
    }

    /// Reads up to `limit` records in ascending order of `key`.
    pub async fn find_all_sorted(
        &self,
        store: &dyn DocumentStore,
        key: SortKey,
        limit: usize,
    ) -> StoreResult<Vec<AdRecord>> {
        let query = FindQuery::new(RecordFilter::all(), limit).sorted(key, SortOrder::Ascending);
        store.find(self.collection(), &query).await
    }

    /// Explains the query [`find_all_sorted`](Self::find_all_sorted) would run.
    pub async fn explain_sorted(
        &self,
        store: &dyn DocumentStore,
        key: SortKey,
        limit: usize,
    ) -> StoreResult<QueryPlan> {
        let query = FindQuery::new(RecordFilter::all(), limit).sorted(key, SortOrder::Ascending);
        store.explain(self.collection(), &query).await
    }

    /// Usage counters of the collection's indexes.
    pub async fn index_stats(&self, store: &dyn DocumentStore) -> StoreResult<Vec<IndexUsage>> {
        store.index_stats(self.collection()).await
    }

    /// Reads the records of one device created within `[start, end)`.
    pub async fn find_by_device_and_time_range(
        &self,
        store: &dyn DocumentStore,
        device_id: i64,
        start: DateTime,
        end: DateTime,
    ) -> StoreResult<Vec<AdRecord>> {
        let filter = RecordFilter::device_in_range(device_id, start, end);
        let query = FindQuery::new(filter, DEFAULT_READ_LIMIT);
        store.find(self.collection(), &query).await
    }

    /// Sets the fields of `update` on every record matching `filter`.
    ///
    /// An update without fields is a no-op and never reaches the store, which would reject an
    /// empty `$set`.
    pub async fn update_many(
        &self,
        store: &dyn DocumentStore,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> StoreResult<UpdateOutcome> {
        if update.is_empty() {
            tracing::debug!(collection = self.collection(), "skipping empty update");
            return Ok(UpdateOutcome::default());
        }
        store.update_many(self.collection(), filter, update).await
    }
}

#[cfg(test)]
mod tests {
    use crate::Error;
    use crate::backend::{Connector, InMemoryStore};
    use crate::document::DocumentGenerator;
    use crate::observer::Observer;

    use super::*;

    #[test]
    fn parses_kind_aliases() {
        assert_eq!("c".parse::<StrategyKind>().unwrap(), StrategyKind::Clustered);
        assert_eq!(
            "Non-Clustered".parse::<StrategyKind>().unwrap(),
            StrategyKind::Secondary
        );
        assert_eq!("ts".parse::<StrategyKind>().unwrap(), StrategyKind::TimeSeries);
        assert!("btree".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn rejects_mismatched_index() {
        let index = IndexDefinition::new("bad", ["deviceId", "timeStamp"], [1]);
        assert_eq!(
            index.validate(),
            Err(ConfigError::MismatchedIndex {
                name: "bad".into(),
                fields: 2,
                orders: 1,
            })
        );
    }

    #[test]
    fn rejects_empty_index_and_bad_orders() {
        let empty = IndexDefinition::new("empty", Vec::<String>::new(), []);
        assert!(matches!(
            empty.validate(),
            Err(ConfigError::EmptyIndex { .. })
        ));

        let sideways = IndexDefinition::new("sideways", ["deviceId"], [0]);
        assert!(matches!(
            sideways.validate(),
            Err(ConfigError::InvalidSortOrder { order: 0, .. })
        ));
    }

    #[test]
    fn default_collections_and_layouts() {
        let clustered = StorageStrategy::new(StrategyKind::Clustered, None, default_indexes());
        assert_eq!(clustered.collection(), "AdvertisementHistoryMDBClustered");
        assert_eq!(clustered.layout(), CollectionLayout::Clustered);
        assert!(clustered.validate().unwrap().is_empty());

        let series = StorageStrategy::new(StrategyKind::TimeSeries, Some("ts".into()), vec![]);
        assert_eq!(series.collection(), "ts");
        assert_eq!(
            series.layout(),
            CollectionLayout::TimeSeries {
                time_field: "timeStamp".into(),
                meta_field: "deviceId".into(),
            }
        );
    }

    #[tokio::test]
    async fn malformed_index_aborts_before_store_is_touched() {
        let store = InMemoryStore::default();
        let observer = Observer::new();
        let boxed = store.connect(observer.clone()).await.unwrap();

        let strategy = StorageStrategy::new(
            StrategyKind::Secondary,
            None,
            vec![IndexDefinition::new("bad", ["deviceId", "timeStamp"], [1])],
        );

        let result = strategy.ensure_schema(boxed.as_ref()).await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::MismatchedIndex { .. }))
        ));
        assert_eq!(store.layout(strategy.collection()), None);
    }

    #[tokio::test]
    async fn secondary_schema_creates_all_indexes() {
        let store = InMemoryStore::default();
        let boxed = store.connect(Observer::new()).await.unwrap();

        let strategy = StorageStrategy::new(StrategyKind::Secondary, None, default_indexes());
        let names = strategy.ensure_schema(boxed.as_ref()).await.unwrap();
        assert_eq!(names, ["deviceId_1_timeStamp_1", "reqRefNo_1"]);

        // running it again changes nothing
        strategy.ensure_schema(boxed.as_ref()).await.unwrap();
        let listed = boxed.list_indexes(strategy.collection()).await.unwrap();
        assert_eq!(listed, ["_id_", "deviceId_1_timeStamp_1", "reqRefNo_1"]);
    }

    #[tokio::test]
    async fn reads_and_updates_go_to_target_collection() {
        let store = InMemoryStore::default();
        let boxed = store.connect(Observer::new()).await.unwrap();
        let generator = DocumentGenerator::new(5);

        let strategy = StorageStrategy::new(StrategyKind::Clustered, None, vec![]);
        strategy.ensure_schema(boxed.as_ref()).await.unwrap();
        for _ in 0..25 {
            strategy
                .insert(boxed.as_ref(), &generator.next())
                .await
                .unwrap();
        }

        assert_eq!(strategy.find_all(boxed.as_ref(), 10).await.unwrap().len(), 10);
        let sorted = strategy
            .find_all_sorted(boxed.as_ref(), SortKey::DeviceId, 100)
            .await
            .unwrap();
        assert!(sorted.windows(2).all(|w| w[0].device_id <= w[1].device_id));

        let start = DateTime::from_millis(0);
        let end = DateTime::from_millis(i64::MAX);
        let device = strategy
            .find_by_device_and_time_range(boxed.as_ref(), 2, start, end)
            .await
            .unwrap();
        assert_eq!(device.len(), 5);

        let outcome = strategy
            .update_many(
                boxed.as_ref(),
                &RecordFilter::device_in_range(2, start, end),
                &RecordUpdate {
                    audio_played: Some(88),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 5, modified: 5 });
        assert_eq!(store.records(strategy.collection()).len(), 25);
    }

    #[tokio::test]
    async fn explains_secondary_key_sort() {
        let store = InMemoryStore::default();
        let boxed = store.connect(Observer::new()).await.unwrap();
        let generator = DocumentGenerator::new(3);

        let indexed = StorageStrategy::new(StrategyKind::Secondary, None, default_indexes());
        let clustered = StorageStrategy::new(StrategyKind::Clustered, None, Vec::new());
        for strategy in [&indexed, &clustered] {
            strategy.ensure_schema(boxed.as_ref()).await.unwrap();
            for _ in 0..6 {
                strategy.insert(boxed.as_ref(), &generator.next()).await.unwrap();
            }
        }

        let key = indexed.secondary_sort_key();
        let plan = indexed.explain_sorted(boxed.as_ref(), key, 4).await.unwrap();
        assert_eq!(plan.index.as_deref(), Some("deviceId_1_timeStamp_1"));
        assert_eq!(plan.returned, 4);

        let plan = clustered.explain_sorted(boxed.as_ref(), key, 4).await.unwrap();
        assert!(plan.is_collection_scan());

        indexed.find_all_sorted(boxed.as_ref(), key, 4).await.unwrap();
        let usage = indexed.index_stats(boxed.as_ref()).await.unwrap();
        let device_index = usage
            .iter()
            .find(|usage| usage.name == "deviceId_1_timeStamp_1")
            .unwrap();
        assert_eq!(device_index.accesses, 1);
    }

    #[tokio::test]
    async fn empty_update_skips_the_store() {
        let store = InMemoryStore::default();
        let boxed = store.connect(Observer::new()).await.unwrap();
        let strategy = StorageStrategy::new(StrategyKind::Clustered, None, Vec::new());

        // every command fails once disconnected
        boxed.disconnect().await.unwrap();

        let outcome = strategy
            .update_many(boxed.as_ref(), &RecordFilter::all(), &RecordUpdate::default())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::default());

        let update = RecordUpdate {
            audio_played: Some(88),
            ..Default::default()
        };
        let result = strategy
            .update_many(boxed.as_ref(), &RecordFilter::all(), &update)
            .await;
        assert!(result.is_err());
    }
}
