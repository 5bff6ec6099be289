//! The store side of the advertisement history benchmark.
//!
//! This crate contains everything that talks to the document database: the synthetic
//! [`AdRecord`]s and their [`DocumentGenerator`], the [`DocumentStore`] abstraction with a MongoDB
//! and an in-memory implementation, the [`StorageStrategy`] variants that decide how records are
//! laid out, and the [`Observer`] which taps the store's command and topology events.
//!
//! It is designed as a library crate to be used by the `adbench-harness`.
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod document;
pub mod error;
pub mod observer;
pub mod query;
pub mod strategy;

pub use backend::{BoxedStore, Connector, DocumentStore, InMemoryStore, MongoConnector};
pub use document::{AdRecord, DocumentGenerator};
pub use error::{ConfigError, Error, Result, StoreError, StoreResult};
pub use observer::{Observer, ServerTally, TopologyEvent};
pub use strategy::{IndexDefinition, StorageStrategy, StrategyKind};

pub use mongodb::bson;
