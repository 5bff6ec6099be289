//! Benchmark harness for advertisement history storage.
//!
//! The harness inserts synthetic [`AdRecord`](adbench_store::AdRecord)s into a document store using
//! one of several [storage strategies](adbench_store::StorageStrategy), optionally reads and
//! updates them afterwards, and reports throughput, latency and which cluster member served each
//! command. The [`Harness`] drives a single run; [`report`] turns its [`RunOutcome`] into output.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod driver;
pub mod metrics;
pub mod observability;
pub mod report;

pub use driver::{Diagnostics, Harness, RunError, RunOutcome, RunSettings, RunState};
