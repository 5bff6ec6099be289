//! The benchmark driver.
//!
//! A [`Harness`] runs one benchmark against one store: it connects with an [`Observer`] attached,
//! sets up the schema of its [`StorageStrategy`], inserts a configured number of records one at a
//! time and optionally runs the read and update benchmarks afterwards. All store calls are issued
//! sequentially so each one can be timed on its own.

use std::fmt;
use std::future::Future;

use adbench_store::bson::DateTime;
use adbench_store::document::DEFAULT_DEVICE_POOL;
use adbench_store::query::{
    DEFAULT_READ_LIMIT, IndexUsage, QueryPlan, RecordFilter, RecordUpdate, ReplicaSetStatus,
    SortKey,
};
use adbench_store::{
    AdRecord, ConfigError, Connector, DocumentGenerator, DocumentStore, Error as StrategyError,
    Observer, ServerTally, StorageStrategy, StoreError, StoreResult, StrategyKind, TopologyEvent,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::{ReadBenchmark, ReadReport, UpdateReport, WriteMetrics, WriteReport};

const PROGRESS_TEMPLATE: &str = "{msg} {wide_bar} {pos}/{len} ({per_sec})";

/// Device and value used by the targeted read and update benchmarks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdateTarget {
    /// Device whose records are read and updated.
    pub device_id: i64,
    /// Value written to `audioPlayed`.
    pub audio_played: i32,
}

impl Default for UpdateTarget {
    fn default() -> Self {
        Self {
            device_id: 18,
            audio_played: 88,
        }
    }
}

/// What a [`Harness`] does in one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Number of inserts in the write phase.
    pub iterations: u64,
    /// Size of the device pool records are spread over.
    pub devices: u64,
    /// Whether to run the read benchmarks.
    pub read_phase: bool,
    /// Upper bound on the records a single read materializes.
    pub read_limit: usize,
    /// Whether to run the update benchmark.
    pub update_phase: bool,
    /// Device and value for the targeted benchmarks.
    pub target: UpdateTarget,
    /// Whether to collect [`Diagnostics`] after the run.
    pub diagnostics: bool,
    /// Whether to draw a progress bar over the write loop.
    pub progress: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            iterations: 1_000_000,
            devices: DEFAULT_DEVICE_POOL,
            read_phase: false,
            read_limit: DEFAULT_READ_LIMIT,
            update_phase: false,
            target: UpdateTarget::default(),
            diagnostics: false,
            progress: false,
        }
    }
}

/// The lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing has happened yet.
    Idle,
    /// Acquiring a store handle.
    Connecting,
    /// Creating the collection and its indexes.
    SchemaReady,
    /// Inserting records.
    Writing,
    /// Running the read benchmarks.
    Reading,
    /// Running the update benchmark.
    Updating,
    /// Collecting diagnostics and releasing the store.
    Draining,
    /// The run completed and produced an outcome.
    Done,
    /// The run aborted.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::SchemaReady => "schema setup",
            Self::Writing => "write phase",
            Self::Reading => "read phase",
            Self::Updating => "update phase",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The store could not be reached.
    #[error("failed to connect to the store")]
    Connect(#[source] StoreError),

    /// The storage strategy is misconfigured.
    #[error("invalid storage configuration")]
    Config(#[from] ConfigError),

    /// The collection or its indexes could not be created.
    #[error("failed to set up the schema")]
    Schema(#[source] StoreError),

    /// The store handle could not be released.
    #[error("failed to disconnect from the store")]
    Disconnect(#[source] StoreError),

    /// The run was cancelled before any records were written.
    #[error("run cancelled during {0}")]
    Cancelled(RunState),
}

/// How the store serves the benchmark's reads, collected after the run.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Plan of the read sorted by the secondary key, if it could be explained.
    pub plan: Option<QueryPlan>,
    /// Accesses per index on the collection.
    pub index_usage: Vec<IndexUsage>,
}

/// Everything a completed run hands to the report sink.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The strategy that was benchmarked.
    pub strategy: StrategyKind,
    /// The collection records were written to.
    pub collection: String,
    /// Write phase results.
    pub write: WriteReport,
    /// Read benchmark results, empty if the phase was skipped.
    pub reads: Vec<ReadReport>,
    /// Update benchmark result, if the phase ran.
    pub update: Option<UpdateReport>,
    /// Commands per cluster member.
    pub tally: ServerTally,
    /// Topology changes in the order they were observed.
    pub topology: Vec<TopologyEvent>,
    /// Inserts the store acknowledged.
    pub inserts_succeeded: u64,
    /// Indexes on the collection after the run.
    pub indexes: Vec<String>,
    /// Replica set membership after the run, if it could be determined.
    pub replica_set: Option<ReplicaSetStatus>,
    /// Query plan and index usage, if diagnostics were enabled.
    pub diagnostics: Option<Diagnostics>,
    /// Whether a phase was cut short by cancellation.
    pub cancelled: bool,
}

/// Runs the benchmark for one storage strategy.
#[derive(Debug)]
pub struct Harness {
    settings: RunSettings,
    strategy: StorageStrategy,
    generator: DocumentGenerator,
    state: RunState,
}

impl Harness {
    /// Creates an idle harness.
    pub fn new(settings: RunSettings, strategy: StorageStrategy) -> Self {
        let generator = DocumentGenerator::new(settings.devices);
        Self {
            settings,
            strategy,
            generator,
            state: RunState::Idle,
        }
    }

    /// The current state of the run.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The generator records are drawn from.
    pub fn generator(&self) -> &DocumentGenerator {
        &self.generator
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = %self.state, to = %next, "run state changed");
        self.state = next;
    }

    /// Runs the benchmark against a store obtained from `connector`.
    ///
    /// Individual failed operations are counted and never abort the run. Failing to connect, an
    /// invalid schema or a failed disconnect do, as does cancellation before the write phase.
    /// Cancellation after that cuts the current phase short and still returns an outcome.
    pub async fn run<C>(
        &mut self,
        connector: &C,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError>
    where
        C: Connector + ?Sized,
    {
        let observer = Observer::new();

        self.transition(RunState::Connecting);
        let store = match cancellable(&cancel, connector.connect(observer.clone())).await {
            Some(Ok(store)) => store,
            Some(Err(error)) => {
                self.transition(RunState::Failed);
                return Err(RunError::Connect(error));
            }
            None => {
                self.transition(RunState::Failed);
                return Err(RunError::Cancelled(RunState::Connecting));
            }
        };
        tracing::info!(backend = store.name(), strategy = %self.strategy.kind(), "connected");

        self.transition(RunState::SchemaReady);
        let schema = cancellable(&cancel, self.strategy.ensure_schema(store.as_ref())).await;
        let error = match schema {
            Some(Ok(_)) => None,
            Some(Err(StrategyError::Config(error))) => Some(RunError::Config(error)),
            Some(Err(StrategyError::Store(error))) => Some(RunError::Schema(error)),
            None => Some(RunError::Cancelled(RunState::SchemaReady)),
        };
        if let Some(error) = error {
            self.transition(RunState::Failed);
            release(store.as_ref()).await;
            return Err(error);
        }

        self.transition(RunState::Writing);
        let window_start = DateTime::now();
        let write = self.write_phase(store.as_ref(), &cancel).await;
        let window_end = DateTime::from_millis(DateTime::now().timestamp_millis() + 1);
        let mut cancelled = write.cancelled;

        let mut reads = Vec::new();
        if self.settings.read_phase && !cancelled {
            self.transition(RunState::Reading);
            for benchmark in ReadBenchmark::ALL {
                let read = self.timed_read(store.as_ref(), benchmark, window_start, window_end);
                match cancellable(&cancel, read).await {
                    Some(report) => reads.push(report),
                    None => {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        let mut update = None;
        if self.settings.update_phase && !cancelled {
            self.transition(RunState::Updating);
            let phase = self.update_phase(store.as_ref(), window_start, window_end);
            match cancellable(&cancel, phase).await {
                Some(report) => update = Some(report),
                None => cancelled = true,
            }
        }

        self.transition(RunState::Draining);
        let inserts_succeeded = observer.inserts_succeeded();
        tracing::info!(inserts_succeeded, "inserts acknowledged by the store");

        let collection = self.strategy.collection().to_owned();
        let indexes = match cancellable(&cancel, store.list_indexes(&collection)).await {
            Some(Ok(indexes)) => {
                tracing::info!(%collection, ?indexes, "collection indexes");
                indexes
            }
            Some(Err(error)) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to list indexes"
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let replica_set = match cancellable(&cancel, store.replica_set_status()).await {
            Some(Ok(status)) => {
                tracing::info!(
                    set = ?status.set_name,
                    primary = ?status.primary,
                    secondaries = ?status.secondaries,
                    "replica set members"
                );
                Some(status)
            }
            Some(Err(error)) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to query replica set status"
                );
                None
            }
            None => None,
        };

        let mut diagnostics = None;
        if self.settings.diagnostics && !cancelled {
            diagnostics = cancellable(&cancel, self.diagnostics(store.as_ref())).await;
        }

        if let Err(error) = store.disconnect().await {
            self.transition(RunState::Failed);
            return Err(RunError::Disconnect(error));
        }

        self.transition(RunState::Done);
        Ok(RunOutcome {
            strategy: self.strategy.kind(),
            collection,
            write,
            reads,
            update,
            tally: observer.tally(),
            topology: observer.topology_events(),
            inserts_succeeded,
            indexes,
            replica_set,
            diagnostics,
            cancelled,
        })
    }

    async fn write_phase(
        &self,
        store: &dyn DocumentStore,
        cancel: &CancellationToken,
    ) -> WriteReport {
        let iterations = self.settings.iterations;
        let bar = if self.settings.progress {
            ProgressBar::new(iterations)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            bar.set_style(style);
        }
        bar.set_message(format!("inserting into {}", self.strategy.collection()));

        let mut metrics = WriteMetrics::default();
        let start = Instant::now();

        for _ in 0..iterations {
            if cancel.is_cancelled() {
                metrics.cancel();
                break;
            }

            let record = self.generator.next();
            let op_start = Instant::now();
            let Some(result) = cancellable(cancel, self.strategy.insert(store, &record)).await
            else {
                metrics.cancel();
                break;
            };

            if let Err(error) = &result {
                tracing::warn!(
                    error = error as &dyn std::error::Error,
                    seq = record.sequence,
                    "insert failed"
                );
            }
            metrics.record(op_start.elapsed(), result.is_ok());
            bar.inc(1);
        }

        bar.finish_and_clear();
        let report = metrics.finish(start.elapsed());
        tracing::info!(
            iterations = report.iterations,
            failures = report.failures,
            elapsed = ?report.elapsed,
            "write phase finished"
        );
        report
    }

    async fn timed_read(
        &self,
        store: &dyn DocumentStore,
        benchmark: ReadBenchmark,
        from: DateTime,
        to: DateTime,
    ) -> ReadReport {
        let start = Instant::now();
        let result = self.read(store, benchmark, from, to).await;
        let elapsed = start.elapsed();

        let documents = match result {
            Ok(records) => Some(records.len()),
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    %benchmark,
                    "read failed"
                );
                None
            }
        };
        tracing::debug!(%benchmark, ?elapsed, ?documents, "read finished");

        ReadReport {
            benchmark,
            elapsed,
            documents,
        }
    }

    async fn read(
        &self,
        store: &dyn DocumentStore,
        benchmark: ReadBenchmark,
        from: DateTime,
        to: DateTime,
    ) -> StoreResult<Vec<AdRecord>> {
        let limit = self.settings.read_limit;
        match benchmark {
            ReadBenchmark::Unsorted => self.strategy.find_all(store, limit).await,
            ReadBenchmark::SortedByPrimaryKey => {
                self.strategy
                    .find_all_sorted(store, SortKey::PrimaryKey, limit)
                    .await
            }
            ReadBenchmark::SortedBySecondaryKey => {
                let key = self.strategy.secondary_sort_key();
                self.strategy.find_all_sorted(store, key, limit).await
            }
            ReadBenchmark::DeviceTimeRange => {
                let device = self.settings.target.device_id;
                self.strategy
                    .find_by_device_and_time_range(store, device, from, to)
                    .await
            }
        }
    }

    async fn diagnostics(&self, store: &dyn DocumentStore) -> Diagnostics {
        let key = self.strategy.secondary_sort_key();
        let plan = match self
            .strategy
            .explain_sorted(store, key, self.settings.read_limit)
            .await
        {
            Ok(plan) => {
                tracing::info!(sort = key.field(), %plan, "query plan");
                Some(plan)
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to explain sorted read"
                );
                None
            }
        };

        let index_usage = match self.strategy.index_stats(store).await {
            Ok(usage) => {
                for index in &usage {
                    tracing::info!(index = %index.name, accesses = index.accesses, "index usage");
                }
                usage
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to collect index usage"
                );
                Vec::new()
            }
        };

        Diagnostics { plan, index_usage }
    }

    async fn update_phase(
        &self,
        store: &dyn DocumentStore,
        from: DateTime,
        to: DateTime,
    ) -> UpdateReport {
        let target = &self.settings.target;
        let filter = RecordFilter::device_in_range(target.device_id, from, to);
        let update = RecordUpdate {
            audio_played: Some(target.audio_played),
            ..Default::default()
        };

        let start = Instant::now();
        let result = self.strategy.update_many(store, &filter, &update).await;
        let elapsed = start.elapsed();

        let outcome = match result {
            Ok(outcome) => {
                tracing::info!(
                    device_id = target.device_id,
                    matched = outcome.matched,
                    modified = outcome.modified,
                    "update finished"
                );
                Some(outcome)
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    device_id = target.device_id,
                    "update failed"
                );
                None
            }
        };

        let verification = self
            .timed_read(store, ReadBenchmark::DeviceTimeRange, from, to)
            .await;

        UpdateReport {
            device_id: target.device_id,
            elapsed,
            outcome,
            verification: Some(verification),
        }
    }
}

/// Races `future` against the run's cancellation token.
async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

/// Disconnects after a failed run, only logging errors.
async fn release(store: &dyn DocumentStore) {
    if let Err(error) = store.disconnect().await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to disconnect after aborted run"
        );
    }
}

#[cfg(test)]
mod tests {
    use adbench_store::{InMemoryStore, StrategyKind};

    use super::*;

    fn settings(iterations: u64) -> RunSettings {
        RunSettings {
            iterations,
            devices: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn walks_through_states() {
        let store = InMemoryStore::new(2);
        let strategy = StorageStrategy::new(StrategyKind::Clustered, None, vec![]);
        let mut harness = Harness::new(settings(3), strategy);
        assert_eq!(harness.state(), RunState::Idle);

        let outcome = harness.run(&store, CancellationToken::new()).await.unwrap();
        assert_eq!(harness.state(), RunState::Done);
        assert_eq!(outcome.write.iterations, 3);
        assert_eq!(outcome.inserts_succeeded, 3);
        assert_eq!(outcome.indexes, ["_id_"]);
        assert_eq!(outcome.replica_set.unwrap().secondaries.len(), 1);
        assert!(store.is_disconnected());
    }

    #[tokio::test]
    async fn cancelled_before_connecting() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let strategy = StorageStrategy::new(StrategyKind::Secondary, None, vec![]);
        let mut harness = Harness::new(settings(3), strategy);
        let result = harness.run(&InMemoryStore::default(), cancel).await;

        assert!(matches!(
            result,
            Err(RunError::Cancelled(RunState::Connecting))
        ));
        assert_eq!(harness.state(), RunState::Failed);
        assert_eq!(harness.generator().issued(), 0);
    }
}
