//! Configuration for the benchmark harness.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Command line arguments (the positional mode and `--iterations`)
//! 2. Environment variables (prefixed with `ADB__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `ADB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `ADB__ITERATIONS=10000` sets the number of inserts
//! - `ADB__BACKEND__TYPE=memory` runs against the in-memory store
//! - `ADB__BACKEND__CONNECTIONS=3` spreads its commands over three members
//!
//! # YAML Configuration File
//!
//! ```yaml
//! backend:
//!   type: mongodb
//!   uri: mongodb://127.0.10.1:27017,127.0.10.2:27017,127.0.10.3:27017/?replicaSet=rs0
//!   database: AdvHistory
//!
//! strategy: secondary
//! iterations: 100000
//! read_phase: true
//!
//! indexes:
//!   - name: deviceId_1_timeStamp_1
//!     fields: [deviceId, timeStamp]
//!     orders: [1, 1]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use adbench_store::document::DEFAULT_DEVICE_POOL;
use adbench_store::query::DEFAULT_READ_LIMIT;
use adbench_store::strategy::default_indexes;
use adbench_store::{IndexDefinition, StorageStrategy, StrategyKind};
use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::driver::{RunSettings, UpdateTarget};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "ADB__";

const DEFAULT_URI: &str =
    "mongodb://127.0.10.1:27017,127.0.10.2:27017,127.0.10.3:27017/?replicaSet=rs0";
const DEFAULT_DATABASE: &str = "AdvHistory";

/// The store to benchmark.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backend {
    /// A MongoDB deployment (type `"mongodb"`).
    MongoDb {
        /// Connection string. May contain credentials, so it is never logged.
        uri: String,
        /// Database holding the benchmark collections.
        database: String,
    },

    /// The in-memory store (type `"memory"`), for dry runs of the harness itself.
    Memory {
        /// Number of synthetic members commands are spread over.
        connections: usize,
    },
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MongoDb { database, .. } => f
                .debug_struct("MongoDb")
                .field("uri", &"[redacted]")
                .field("database", database)
                .finish(),
            Self::Memory { connections } => f
                .debug_struct("Memory")
                .field("connections", connections)
                .finish(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Compact output with colors.
    Pretty,

    /// Plain text output without colors.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// `RUST_LOG` takes precedence if set.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Harness configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The store to run against.
    pub backend: Backend,
    /// Storage strategy; the positional command line argument overrides this.
    ///
    /// Accepts the same names and aliases as the command line, in any case.
    #[serde(with = "display_fromstr")]
    pub strategy: StrategyKind,
    /// Target collection, defaults to the strategy's collection.
    pub collection: Option<String>,
    /// Number of inserts in the write phase.
    pub iterations: u64,
    /// Number of distinct device ids records are spread over.
    pub devices: u64,
    /// Whether to run the read benchmarks after the write phase.
    pub read_phase: bool,
    /// Upper bound on the records a single read materializes.
    pub read_limit: usize,
    /// Whether to run the update benchmark after the reads.
    pub update_phase: bool,
    /// Device and value used by the targeted read and update benchmarks.
    pub update: UpdateTarget,
    /// Secondary indexes, only used by the `secondary` strategy.
    pub indexes: Vec<IndexDefinition>,
    /// Whether to explain the secondary-key read and collect index usage after the run.
    pub diagnostics: bool,
    /// File the topology events are appended to.
    pub event_log: PathBuf,
    /// Whether to draw a progress bar during the write phase.
    pub progress: bool,
    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::MongoDb {
                uri: DEFAULT_URI.to_owned(),
                database: DEFAULT_DATABASE.to_owned(),
            },
            strategy: StrategyKind::default(),
            collection: None,
            iterations: 1_000_000,
            devices: DEFAULT_DEVICE_POOL,
            read_phase: false,
            read_limit: DEFAULT_READ_LIMIT,
            update_phase: false,
            update: UpdateTarget::default(),
            indexes: default_indexes(),
            diagnostics: false,
            event_log: PathBuf::from("events.log"),
            progress: true,
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, the optional YAML file and the environment, in that
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if environment variables
    /// contain invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// The storage strategy for this run.
    pub fn storage_strategy(&self) -> StorageStrategy {
        StorageStrategy::new(self.strategy, self.collection.clone(), self.indexes.clone())
    }

    /// The driver settings for this run.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            iterations: self.iterations,
            devices: self.devices,
            read_phase: self.read_phase,
            read_limit: self.read_limit,
            update_phase: self.update_phase,
            target: self.update.clone(),
            diagnostics: self.diagnostics,
            progress: self.progress,
        }
    }
}
