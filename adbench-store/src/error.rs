use thiserror::Error;

/// Errors in a storage strategy's configuration.
///
/// These are detected before any request is sent to the store and abort a run before its first
/// insert.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The index lists a different number of fields than sort orders.
    #[error("index `{name}` has {fields} fields but {orders} sort orders")]
    MismatchedIndex {
        /// Name of the offending index.
        name: String,
        /// Number of fields listed.
        fields: usize,
        /// Number of sort orders listed.
        orders: usize,
    },

    /// The index does not list any fields.
    #[error("index `{name}` has no fields")]
    EmptyIndex {
        /// Name of the offending index.
        name: String,
    },

    /// A sort order other than `1` or `-1`.
    #[error("index `{name}` uses sort order {order} on `{field}`, expected 1 or -1")]
    InvalidSortOrder {
        /// Name of the offending index.
        name: String,
        /// Field the order was given for.
        field: String,
        /// The rejected value.
        order: i32,
    },
}

/// Errors returned by a [`DocumentStore`](crate::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The client could not be created or the cluster could not be reached.
    #[error("failed to connect: {context}")]
    Connect {
        /// What was being attempted.
        context: String,
        /// The underlying driver error, if any.
        #[source]
        cause: Option<mongodb::error::Error>,
    },

    /// Any error reported by the MongoDB driver for an individual operation.
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// The cluster answered, but with something we could not interpret.
    #[error("unexpected response: {0}")]
    Response(String),

    /// A failure raised by the in-memory store, either injected or due to poisoned state.
    #[error("in-memory store error: {0}")]
    InMemory(String),

    /// The operation was abandoned because the run was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors of storage strategy operations, which may fail on configuration or in the store.
#[derive(Debug, Error)]
pub enum Error {
    /// The strategy is misconfigured.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The store rejected the operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for storage strategy operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
