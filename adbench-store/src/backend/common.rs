use std::fmt::Debug;

use crate::document::AdRecord;
use crate::error::StoreResult;
use crate::observer::Observer;
use crate::query::{
    CollectionLayout, FindQuery, IndexKeys, IndexUsage, QueryPlan, RecordFilter, RecordUpdate,
    ReplicaSetStatus, UpdateOutcome,
};

/// A type-erased [`DocumentStore`] instance.
pub type BoxedStore = Box<dyn DocumentStore>;

/// The document database the benchmark runs against.
///
/// Every call suspends the caller until the store has answered.
#[async_trait::async_trait]
pub trait DocumentStore: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Creates a collection with the given layout. Succeeds if it already exists.
    async fn create_collection(&self, name: &str, layout: &CollectionLayout) -> StoreResult<()>;

    /// Creates all indexes in one request and returns their names in request order.
    async fn create_indexes(&self, collection: &str, indexes: &[IndexKeys])
    -> StoreResult<Vec<String>>;

    /// Lists the names of all indexes on the collection.
    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<String>>;

    /// Inserts a single record.
    async fn insert_one(&self, collection: &str, record: &AdRecord) -> StoreResult<()>;

    /// Runs a bounded query and buffers all results. A limit of zero returns nothing.
    async fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<AdRecord>>;

    /// Applies `update` to every record matching `filter`.
    async fn update_many(
        &self,
        collection: &str,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> StoreResult<UpdateOutcome>;

    /// Usage counters of every index on the collection.
    async fn index_stats(&self, collection: &str) -> StoreResult<Vec<IndexUsage>>;

    /// Describes how `query` would be executed, without returning its records.
    async fn explain(&self, collection: &str, query: &FindQuery) -> StoreResult<QueryPlan>;

    /// Reports which members currently act as primary and secondaries.
    async fn replica_set_status(&self) -> StoreResult<ReplicaSetStatus>;

    /// Gracefully closes the client. The store must not be used afterwards.
    async fn disconnect(&self) -> StoreResult<()>;
}

/// Opens a [`DocumentStore`] with an [`Observer`] attached from the first command on.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connects to the store. Failing here is not retried.
    async fn connect(&self, observer: Observer) -> StoreResult<BoxedStore>;
}
