pub(crate) mod common;
mod in_memory;
mod mongo;

pub use common::{BoxedStore, Connector, DocumentStore};
pub use in_memory::InMemoryStore;
pub use mongo::{MongoConnector, MongoStore};
