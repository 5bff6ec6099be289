//! Logging setup for the `adbench` binary.

use std::env;
use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global subscriber, writing to stderr in the configured format.
pub fn init_tracing(logging: &Logging) {
    let (level, env_filter) = parse_rust_log(logging.level);

    let format = match logging.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Simplified => layer.with_ansi(false).boxed(),
        LogFormat::Pretty | LogFormat::Auto => layer.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(level))
        .with(env_filter)
        .init();
}

/// Determines the log level and per-crate filter.
///
/// `RUST_LOG` wins over `default` if it parses as a plain level. Anything else in `RUST_LOG` is
/// used verbatim as the filter.
pub fn parse_rust_log(default: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => default,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        adbench_harness=TRACE,\
        adbench_store=TRACE,\
        mongodb=WARN,\
        ",
    );

    (level, env_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_without_rust_log() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let (level, filter) = parse_rust_log(LevelFilter::DEBUG);
            assert_eq!(level, LevelFilter::DEBUG);
            assert!(filter.to_string().contains("adbench_store=trace"));
            Ok(())
        });
    }

    #[test]
    fn rust_log_level_overrides_config() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RUST_LOG", "warn");
            let (level, _) = parse_rust_log(LevelFilter::DEBUG);
            assert_eq!(level, LevelFilter::WARN);
            Ok(())
        });
    }

    #[test]
    fn rust_log_directives_are_used_verbatim() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RUST_LOG", "adbench_harness=debug");
            let (level, filter) = parse_rust_log(LevelFilter::INFO);
            assert_eq!(level, LevelFilter::TRACE);
            assert!(filter.to_string().contains("adbench_harness=debug"));
            assert!(!filter.to_string().contains("mongodb"));
            Ok(())
        });
    }
}
