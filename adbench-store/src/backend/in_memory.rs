//! In-memory store for tests and dry runs.
//!
//! This provides a [`DocumentStore`] backed by insertion-ordered vectors, removing the need for a
//! running cluster. Commands are spread round-robin over a number of synthetic connections and
//! reported to the attached [`Observer`] just like the MongoDB driver would. The store is
//! [`Clone`] so tests can hold a handle for direct inspection while the harness owns a boxed copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mongodb::bson::oid::ObjectId;

use super::common::{BoxedStore, Connector, DocumentStore};
use crate::document::AdRecord;
use crate::error::{StoreError, StoreResult};
use crate::observer::{Observer, TopologyEvent};
use crate::query::{
    CollectionLayout, FindQuery, IndexKeys, IndexUsage, QueryPlan, RecordFilter, RecordUpdate,
    ReplicaSetStatus, SortKey, SortOrder, UpdateOutcome,
};
use crate::strategy::DEVICE_FIELD;

const SET_NAME: &str = "memory";
const PRIMARY_INDEX: &str = "_id_";

#[derive(Debug, Default)]
struct Collection {
    layout: Option<CollectionLayout>,
    indexes: Vec<IndexKeys>,
    accesses: HashMap<String, u64>,
    records: Vec<AdRecord>,
}

impl Collection {
    fn has_primary_index(&self) -> bool {
        !matches!(self.layout, Some(CollectionLayout::TimeSeries { .. }))
    }

    fn index_names(&self) -> Vec<String> {
        let primary = self.has_primary_index().then(|| PRIMARY_INDEX.to_owned());
        primary
            .into_iter()
            .chain(self.indexes.iter().map(|index| index.name.clone()))
            .collect()
    }

    /// Picks the index whose leading key serves the query's filter or sort.
    fn choose_index(&self, query: &FindQuery) -> Option<String> {
        let field = match (query.filter.device_id, query.sort) {
            (Some(_), _) => DEVICE_FIELD,
            (None, Some((key, _))) => key.field(),
            (None, None) => return None,
        };

        if field == SortKey::PrimaryKey.field() {
            return self.has_primary_index().then(|| PRIMARY_INDEX.to_owned());
        }
        self.indexes
            .iter()
            .find(|index| index.keys.first().is_some_and(|(leading, _)| leading == field))
            .map(|index| index.name.clone())
    }
}

#[derive(Debug, Default)]
struct Shared {
    collections: Mutex<HashMap<String, Collection>>,
    next_connection: AtomicUsize,
    insert_attempts: AtomicU64,
    disconnected: AtomicBool,
}

/// A [`DocumentStore`] keeping all records in memory.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    connections: usize,
    latency: Option<Duration>,
    failing_inserts: Vec<u64>,
    refuse_connections: bool,
    fail_disconnect: bool,
    observer: Option<Observer>,
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Creates an empty store that spreads commands over `connections` members.
    pub fn new(connections: usize) -> Self {
        Self {
            connections: connections.max(1),
            latency: None,
            failing_inserts: Vec::new(),
            refuse_connections: false,
            fail_disconnect: false,
            observer: None,
            shared: Arc::default(),
        }
    }

    /// Delays every command by `latency` using the tokio clock.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the `attempt`-th insert (counting from 1) fail.
    pub fn fail_insert(mut self, attempt: u64) -> Self {
        self.failing_inserts.push(attempt);
        self
    }

    /// Makes [`Connector::connect`] fail.
    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connections = true;
        self
    }

    /// Makes [`DocumentStore::disconnect`] fail.
    pub fn failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    /// Returns a copy of all records in a collection, in insertion order.
    pub fn records(&self, collection: &str) -> Vec<AdRecord> {
        self.read(collection, |c| c.records.clone())
            .unwrap_or_default()
    }

    /// Returns the layout a collection was created with, if it was created explicitly.
    pub fn layout(&self, collection: &str) -> Option<CollectionLayout> {
        self.read(collection, |c| c.layout.clone()).flatten()
    }

    /// Number of inserts attempted, including failed ones.
    pub fn insert_attempts(&self) -> u64 {
        self.shared.insert_attempts.load(Ordering::Relaxed)
    }

    /// Whether [`DocumentStore::disconnect`] has been called successfully.
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Relaxed)
    }

    fn read<T>(&self, collection: &str, f: impl FnOnce(&Collection) -> T) -> Option<T> {
        let collections = self.shared.collections.lock().ok()?;
        collections.get(collection).map(f)
    }

    fn member_address(index: usize) -> String {
        format!("memory-{index}:27017")
    }

    fn next_connection(&self) -> String {
        let index = self.shared.next_connection.fetch_add(1, Ordering::Relaxed) % self.connections;
        format!("{}#{index}", Self::member_address(index))
    }

    /// Runs `op` as one command, reporting it to the observer.
    async fn command<T, F>(&self, command_name: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce(&mut HashMap<String, Collection>) -> StoreResult<T> + Send,
        T: Send,
    {
        let connection = self.next_connection();
        if let Some(observer) = &self.observer {
            observer.command_started(command_name, &connection);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if self.shared.disconnected.load(Ordering::Relaxed) {
            Err(StoreError::InMemory("store is disconnected".into()))
        } else {
            match self.shared.collections.lock() {
                Ok(mut collections) => op(&mut collections),
                Err(_) => Err(StoreError::InMemory("store state is poisoned".into())),
            }
        };

        if let Some(observer) = &self.observer {
            match &result {
                Ok(_) => observer.command_succeeded(command_name, &connection),
                Err(error) => observer.command_failed(command_name, &connection, error),
            }
        }
        result
    }
}

fn existing<'a>(
    collections: &'a HashMap<String, Collection>,
    name: &str,
) -> StoreResult<&'a Collection> {
    collections
        .get(name)
        .ok_or_else(|| StoreError::InMemory(format!("collection `{name}` does not exist")))
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait::async_trait]
impl Connector for InMemoryStore {
    async fn connect(&self, observer: Observer) -> StoreResult<BoxedStore> {
        if self.refuse_connections {
            return Err(StoreError::Connect {
                context: "in-memory store refuses connections".into(),
                cause: None,
            });
        }

        for index in 0..self.connections {
            let role = if index == 0 { "RsPrimary" } else { "RsSecondary" };
            observer.server_description_changed(TopologyEvent::new(
                Self::member_address(index),
                "Unknown",
                role,
            ));
        }

        let mut store = self.clone();
        store.observer = Some(observer);
        Ok(Box::new(store))
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn create_collection(&self, name: &str, layout: &CollectionLayout) -> StoreResult<()> {
        self.command("create", |collections| {
            let collection = collections.entry(name.to_owned()).or_default();
            if collection.layout.is_none() {
                collection.layout = Some(layout.clone());
            }
            Ok(())
        })
        .await
    }

    async fn create_indexes(
        &self,
        collection: &str,
        indexes: &[IndexKeys],
    ) -> StoreResult<Vec<String>> {
        self.command("createIndexes", |collections| {
            let collection = collections.entry(collection.to_owned()).or_default();
            let mut names = Vec::with_capacity(indexes.len());
            for index in indexes {
                if !collection.indexes.iter().any(|known| known.name == index.name) {
                    collection.indexes.push(index.clone());
                }
                names.push(index.name.clone());
            }
            Ok(names)
        })
        .await
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.command("listIndexes", |collections| {
            Ok(existing(collections, collection)?.index_names())
        })
        .await
    }

    async fn insert_one(&self, collection: &str, record: &AdRecord) -> StoreResult<()> {
        let attempt = self.shared.insert_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let fail = self.failing_inserts.contains(&attempt);

        self.command("insert", |collections| {
            if fail {
                return Err(StoreError::InMemory(format!(
                    "injected failure on insert {attempt}"
                )));
            }

            let mut record = record.clone();
            record.id.get_or_insert_with(ObjectId::new);
            collections
                .entry(collection.to_owned())
                .or_default()
                .records
                .push(record);
            Ok(())
        })
        .await
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<AdRecord>> {
        self.command("find", |collections| {
            let Some(collection) = collections.get_mut(collection) else {
                return Ok(Vec::new());
            };
            if let Some(index) = collection.choose_index(query) {
                *collection.accesses.entry(index).or_default() += 1;
            }

            let mut found: Vec<_> = collection
                .records
                .iter()
                .filter(|record| query.filter.matches(record))
                .cloned()
                .collect();

            match query.sort {
                // records are kept in primary key order already
                Some((SortKey::PrimaryKey, SortOrder::Descending)) => found.reverse(),
                Some((key, order)) => found.sort_by(|a, b| {
                    let ordering = key.compare(a, b).unwrap_or(std::cmp::Ordering::Equal);
                    match order {
                        SortOrder::Ascending => ordering,
                        SortOrder::Descending => ordering.reverse(),
                    }
                }),
                None => {}
            }

            found.truncate(query.limit);
            Ok(found)
        })
        .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> StoreResult<UpdateOutcome> {
        self.command("update", |collections| {
            let mut outcome = UpdateOutcome::default();
            let Some(collection) = collections.get_mut(collection) else {
                return Ok(outcome);
            };

            for record in collection.records.iter_mut() {
                if filter.matches(record) {
                    outcome.matched += 1;
                    if update.apply(record) {
                        outcome.modified += 1;
                    }
                }
            }
            Ok(outcome)
        })
        .await
    }

    async fn index_stats(&self, collection: &str) -> StoreResult<Vec<IndexUsage>> {
        self.command("aggregate", |collections| {
            let collection = existing(collections, collection)?;
            let usage = collection
                .index_names()
                .into_iter()
                .map(|name| IndexUsage {
                    accesses: collection.accesses.get(&name).copied().unwrap_or_default(),
                    name,
                })
                .collect();
            Ok(usage)
        })
        .await
    }

    async fn explain(&self, collection: &str, query: &FindQuery) -> StoreResult<QueryPlan> {
        self.command("explain", |collections| {
            let collection = existing(collections, collection)?;
            let matched = collection
                .records
                .iter()
                .filter(|record| query.filter.matches(record))
                .count() as u64;
            let returned = matched.min(query.limit as u64);

            let plan = match collection.choose_index(query) {
                Some(index) => QueryPlan {
                    stage: "IXSCAN".to_owned(),
                    index: Some(index),
                    keys_examined: matched,
                    docs_examined: matched,
                    returned,
                },
                None => QueryPlan {
                    stage: "COLLSCAN".to_owned(),
                    index: None,
                    keys_examined: 0,
                    docs_examined: collection.records.len() as u64,
                    returned,
                },
            };
            Ok(plan)
        })
        .await
    }

    async fn replica_set_status(&self) -> StoreResult<ReplicaSetStatus> {
        let connections = self.connections;
        self.command("replSetGetStatus", |_| {
            Ok(ReplicaSetStatus {
                set_name: Some(SET_NAME.to_owned()),
                primary: Some(Self::member_address(0)),
                secondaries: (1..connections).map(Self::member_address).collect(),
            })
        })
        .await
    }

    async fn disconnect(&self) -> StoreResult<()> {
        if self.fail_disconnect {
            return Err(StoreError::InMemory("failed to close connections".into()));
        }
        self.shared.disconnected.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::DateTime;

    use crate::document::DocumentGenerator;

    use super::*;

    const COLLECTION: &str = "test";

    async fn connected(store: &InMemoryStore) -> (BoxedStore, Observer) {
        let observer = Observer::new();
        let boxed = store.connect(observer.clone()).await.unwrap();
        (boxed, observer)
    }

    #[tokio::test]
    async fn spreads_commands_round_robin() {
        let store = InMemoryStore::new(3);
        let (boxed, observer) = connected(&store).await;
        let generator = DocumentGenerator::default();

        for _ in 0..9 {
            boxed.insert_one(COLLECTION, &generator.next()).await.unwrap();
        }

        let tally = observer.tally();
        assert_eq!(tally.writes.len(), 3);
        assert!(tally.writes.values().all(|&count| count == 3));
        assert_eq!(observer.inserts_succeeded(), 9);
        assert_eq!(observer.topology_events().len(), 3);
    }

    #[tokio::test]
    async fn assigns_primary_keys_and_keeps_order() {
        let store = InMemoryStore::default();
        let (boxed, _observer) = connected(&store).await;
        let generator = DocumentGenerator::default();

        for _ in 0..5 {
            boxed.insert_one(COLLECTION, &generator.next()).await.unwrap();
        }

        let records = store.records(COLLECTION);
        assert!(records.iter().all(|record| record.id.is_some()));
        let sequences: Vec<_> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [1, 2, 3, 4, 5]);

        let query = FindQuery::new(RecordFilter::all(), 2)
            .sorted(SortKey::PrimaryKey, SortOrder::Descending);
        let newest: Vec<_> = boxed
            .find(COLLECTION, &query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(newest, [5, 4]);
    }

    #[tokio::test]
    async fn injected_insert_failure() {
        let store = InMemoryStore::default().fail_insert(2);
        let (boxed, observer) = connected(&store).await;
        let generator = DocumentGenerator::default();

        assert!(boxed.insert_one(COLLECTION, &generator.next()).await.is_ok());
        assert!(boxed.insert_one(COLLECTION, &generator.next()).await.is_err());
        assert!(boxed.insert_one(COLLECTION, &generator.next()).await.is_ok());

        assert_eq!(store.insert_attempts(), 3);
        assert_eq!(store.records(COLLECTION).len(), 2);
        assert_eq!(observer.inserts_succeeded(), 2);
        assert_eq!(observer.tally().total_writes(), 3);
    }

    #[tokio::test]
    async fn update_distinguishes_matched_and_modified() {
        let store = InMemoryStore::default();
        let (boxed, _observer) = connected(&store).await;
        let generator = DocumentGenerator::new(2);

        for _ in 0..6 {
            boxed.insert_one(COLLECTION, &generator.next()).await.unwrap();
        }

        let filter = RecordFilter {
            device_id: Some(1),
            ..Default::default()
        };
        // device 1 holds sequences 1, 3, 5, which all have audio_played = 1 already
        let update = RecordUpdate {
            audio_played: Some(1),
            ..Default::default()
        };
        let outcome = boxed.update_many(COLLECTION, &filter, &update).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 3, modified: 0 });

        let update = RecordUpdate {
            audio_played: Some(88),
            ..Default::default()
        };
        let outcome = boxed.update_many(COLLECTION, &filter, &update).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 3, modified: 3 });
    }

    #[tokio::test]
    async fn find_respects_filter_sort_and_limit() {
        let store = InMemoryStore::default();
        let (boxed, _observer) = connected(&store).await;
        let generator = DocumentGenerator::new(4);

        for _ in 0..20 {
            boxed.insert_one(COLLECTION, &generator.next()).await.unwrap();
        }

        let query = FindQuery::new(RecordFilter::all(), 8)
            .sorted(SortKey::DeviceId, SortOrder::Ascending);
        let devices: Vec<_> = boxed
            .find(COLLECTION, &query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.device_id)
            .collect();
        assert_eq!(devices, [1, 1, 1, 1, 1, 2, 2, 2]);

        let window = RecordFilter::device_in_range(
            3,
            DateTime::from_millis(0),
            DateTime::from_millis(i64::MAX),
        );
        let found = boxed
            .find(COLLECTION, &FindQuery::new(window, 100))
            .await
            .unwrap();
        assert_eq!(found.len(), 5);
        assert!(found.iter().all(|r| r.device_id == 3));
    }

    #[tokio::test]
    async fn zero_limit_returns_nothing() {
        let store = InMemoryStore::default();
        let (boxed, _observer) = connected(&store).await;
        let generator = DocumentGenerator::default();

        for _ in 0..3 {
            boxed.insert_one(COLLECTION, &generator.next()).await.unwrap();
        }

        let found = boxed
            .find(COLLECTION, &FindQuery::new(RecordFilter::all(), 0))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn explain_and_index_stats() {
        let store = InMemoryStore::default();
        let (boxed, _observer) = connected(&store).await;
        let generator = DocumentGenerator::new(2);

        boxed
            .create_collection(COLLECTION, &CollectionLayout::Plain)
            .await
            .unwrap();
        let index = IndexKeys {
            name: "deviceId_1".into(),
            keys: vec![(DEVICE_FIELD.into(), SortOrder::Ascending)],
        };
        boxed.create_indexes(COLLECTION, &[index]).await.unwrap();
        for _ in 0..6 {
            boxed.insert_one(COLLECTION, &generator.next()).await.unwrap();
        }

        let by_device = FindQuery::new(RecordFilter::all(), 4)
            .sorted(SortKey::DeviceId, SortOrder::Ascending);
        let plan = boxed.explain(COLLECTION, &by_device).await.unwrap();
        assert_eq!(plan.stage, "IXSCAN");
        assert_eq!(plan.index.as_deref(), Some("deviceId_1"));
        assert_eq!(plan.returned, 4);

        let by_time = FindQuery::new(RecordFilter::all(), 10)
            .sorted(SortKey::Timestamp, SortOrder::Ascending);
        let plan = boxed.explain(COLLECTION, &by_time).await.unwrap();
        assert!(plan.is_collection_scan());
        assert_eq!(plan.docs_examined, 6);

        // explain does not count as an index access
        boxed.find(COLLECTION, &by_device).await.unwrap();
        boxed.find(COLLECTION, &by_device).await.unwrap();
        let usage = boxed.index_stats(COLLECTION).await.unwrap();
        assert_eq!(
            usage,
            [
                IndexUsage {
                    name: "_id_".into(),
                    accesses: 0,
                },
                IndexUsage {
                    name: "deviceId_1".into(),
                    accesses: 2,
                },
            ]
        );

        assert!(boxed.index_stats("missing").await.is_err());
    }

    #[tokio::test]
    async fn create_collection_is_idempotent() {
        let store = InMemoryStore::default();
        let (boxed, _observer) = connected(&store).await;

        boxed
            .create_collection(COLLECTION, &CollectionLayout::Clustered)
            .await
            .unwrap();
        boxed
            .create_collection(COLLECTION, &CollectionLayout::Plain)
            .await
            .unwrap();

        assert_eq!(store.layout(COLLECTION), Some(CollectionLayout::Clustered));
        assert_eq!(boxed.list_indexes(COLLECTION).await.unwrap(), ["_id_"]);
    }

    #[tokio::test]
    async fn refuses_connections() {
        let store = InMemoryStore::default().refusing_connections();
        let result = store.connect(Observer::new()).await;
        assert!(matches!(result, Err(StoreError::Connect { .. })));
    }

    #[tokio::test]
    async fn rejects_commands_after_disconnect() {
        let store = InMemoryStore::new(2);
        let (boxed, _observer) = connected(&store).await;

        boxed.disconnect().await.unwrap();
        assert!(store.is_disconnected());

        let record = DocumentGenerator::default().next();
        assert!(boxed.insert_one(COLLECTION, &record).await.is_err());
    }
}
