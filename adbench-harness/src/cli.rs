//! Command line entry point of the `adbench` binary.

use std::path::PathBuf;

use adbench_store::{InMemoryStore, MongoConnector, StrategyKind};
use anyhow::{Context, Result};
use argh::FromArgs;
use tokio_util::sync::CancellationToken;

use crate::config::{Backend, Config};
use crate::driver::Harness;
use crate::{observability, report};

/// Insert and query benchmark for advertisement history on a MongoDB replica set.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// number of records to insert, overrides the configuration
    #[argh(option, short = 'n')]
    pub iterations: Option<u64>,

    /// storage strategy: "clustered", "secondary" (default) or "timeseries"
    #[argh(positional)]
    pub mode: Option<StrategyKind>,
}

/// Bootstrap the runtime and run the benchmark.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.strategy = mode;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("adbench-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping benchmark");
                cancel.cancel();
            }
        }
    });

    let mut harness = Harness::new(config.run_settings(), config.storage_strategy());
    let result = match &config.backend {
        Backend::MongoDb { uri, database } => {
            let connector = MongoConnector::new(uri.as_str(), database.as_str());
            harness.run(&connector, cancel).await
        }
        Backend::Memory { connections } => {
            harness.run(&InMemoryStore::new(*connections), cancel).await
        }
    };
    let outcome = result.context("benchmark aborted")?;

    report::emit(&outcome);
    if let Err(error) = report::persist(&outcome.topology, &config.event_log) {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            path = %config.event_log.display(),
            "failed to persist topology events"
        );
    }

    Ok(())
}
