//! Timing of the individual benchmark phases.

use std::fmt;
use std::time::Duration;

use adbench_store::query::UpdateOutcome;
use sketches_ddsketch::DDSketch;

/// Accumulates per-insert timings during the write phase.
///
/// Derived rates are computed once by [`WriteMetrics::finish`], never while the loop runs.
#[derive(Default)]
pub struct WriteMetrics {
    attempted: u64,
    failures: u64,
    cumulative: Duration,
    latencies: DDSketch,
    cancelled: bool,
}

impl WriteMetrics {
    /// Records one insert attempt and how long it took.
    pub fn record(&mut self, latency: Duration, succeeded: bool) {
        self.attempted += 1;
        if !succeeded {
            self.failures += 1;
        }
        self.cumulative += latency;
        self.latencies.add(latency.as_secs_f64());
    }

    /// Marks the phase as stopped early.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Closes the phase, given the wall-clock duration of the whole loop.
    pub fn finish(self, elapsed: Duration) -> WriteReport {
        let (insertions_per_second, average_latency) = if self.attempted == 0 {
            (0.0, 0.0)
        } else {
            let iterations = self.attempted as f64;
            let per_second = if elapsed.is_zero() {
                0.0
            } else {
                iterations / elapsed.as_secs_f64()
            };
            (per_second, self.cumulative.as_secs_f64() / iterations)
        };

        let quantile = |q| {
            self.latencies
                .quantile(q)
                .ok()
                .flatten()
                .map(Duration::from_secs_f64)
        };

        WriteReport {
            iterations: self.attempted,
            failures: self.failures,
            elapsed,
            cumulative: self.cumulative,
            insertions_per_second,
            average_latency,
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
            cancelled: self.cancelled,
        }
    }
}

impl fmt::Debug for WriteMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteMetrics")
            .field("attempted", &self.attempted)
            .field("failures", &self.failures)
            .field("cumulative", &self.cumulative)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

/// Final numbers of the write phase.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    /// Inserts attempted, including failed ones.
    pub iterations: u64,
    /// Inserts that returned an error.
    pub failures: u64,
    /// Wall-clock duration of the whole loop.
    pub elapsed: Duration,
    /// Sum of the individual insert durations.
    pub cumulative: Duration,
    /// `iterations / elapsed`.
    pub insertions_per_second: f64,
    /// `cumulative / iterations`, in seconds.
    pub average_latency: f64,
    /// Median insert latency.
    pub p50: Option<Duration>,
    /// 90th percentile insert latency.
    pub p90: Option<Duration>,
    /// 99th percentile insert latency.
    pub p99: Option<Duration>,
    /// Whether the loop was cut short by cancellation.
    pub cancelled: bool,
}

/// The read benchmarks, run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBenchmark {
    /// All records, unsorted.
    Unsorted,
    /// All records sorted by `_id`.
    SortedByPrimaryKey,
    /// All records sorted by the strategy's secondary key.
    SortedBySecondaryKey,
    /// One device's records within the run's time window.
    DeviceTimeRange,
}

impl ReadBenchmark {
    /// All read benchmarks.
    pub const ALL: [Self; 4] = [
        Self::Unsorted,
        Self::SortedByPrimaryKey,
        Self::SortedBySecondaryKey,
        Self::DeviceTimeRange,
    ];
}

impl fmt::Display for ReadBenchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsorted => "unsorted scan",
            Self::SortedByPrimaryKey => "sorted by primary key",
            Self::SortedBySecondaryKey => "sorted by secondary key",
            Self::DeviceTimeRange => "device and time range",
        };
        f.write_str(name)
    }
}

/// Outcome of a single read benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadReport {
    /// Which benchmark ran.
    pub benchmark: ReadBenchmark,
    /// How long the read took, including buffering all results.
    pub elapsed: Duration,
    /// Records returned, or `None` if the read failed.
    pub documents: Option<usize>,
}

/// Outcome of a single update benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    /// Device whose records were updated.
    pub device_id: i64,
    /// How long the update took.
    pub elapsed: Duration,
    /// Matched and modified counts, or `None` if the update failed.
    pub outcome: Option<UpdateOutcome>,
    /// The device and time range read issued right after the update.
    pub verification: Option<ReadReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_from_fixed_latency() {
        let latency = Duration::from_millis(4);
        let mut metrics = WriteMetrics::default();
        for _ in 0..250 {
            metrics.record(latency, true);
        }

        let report = metrics.finish(latency * 250);
        assert_eq!(report.iterations, 250);
        assert_eq!(report.failures, 0);
        assert!((report.insertions_per_second - 250.0).abs() < 1e-9);
        assert!((report.average_latency - 0.004).abs() < 1e-12);

        let p50 = report.p50.unwrap().as_secs_f64();
        assert!((p50 - 0.004).abs() < 0.004 * 0.02, "p50 was {p50}");
    }

    #[test]
    fn failures_are_counted_not_dropped() {
        let mut metrics = WriteMetrics::default();
        metrics.record(Duration::from_millis(1), true);
        metrics.record(Duration::from_millis(1), false);
        metrics.record(Duration::from_millis(1), true);

        let report = metrics.finish(Duration::from_millis(3));
        assert_eq!(report.iterations, 3);
        assert_eq!(report.failures, 1);
    }

    #[test]
    fn empty_phase_has_zero_rates() {
        let report = WriteMetrics::default().finish(Duration::ZERO);

        assert_eq!(report.iterations, 0);
        assert_eq!(report.insertions_per_second, 0.0);
        assert_eq!(report.average_latency, 0.0);
        assert_eq!(report.p50, None);
        assert!(!report.cancelled);
    }
}
