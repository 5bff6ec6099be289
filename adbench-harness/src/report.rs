//! Printing run results and persisting the topology event log.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use adbench_store::TopologyEvent;
use yansi::Paint;

use crate::driver::RunOutcome;
use crate::metrics::{ReadReport, WriteReport};

/// Human-readable summary of a run.
#[derive(Debug)]
pub struct Summary<'a>(pub &'a RunOutcome);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self.0;
        write!(
            f,
            "{} {} ({})",
            "## Benchmark".bold(),
            outcome.strategy.bold().blue(),
            outcome.collection
        )?;
        if outcome.cancelled {
            write!(f, " {}", "CANCELLED".bold().yellow())?;
        }
        writeln!(f)?;

        write_phase(f, &outcome.write)?;

        if !outcome.reads.is_empty() {
            writeln!(f, "{}", "READ:".bold().green())?;
            for read in &outcome.reads {
                read_line(f, read)?;
            }
        }

        if let Some(update) = &outcome.update {
            write!(
                f,
                "{} device {} in {}",
                "UPDATE:".bold().green(),
                update.device_id.bold(),
                seconds(update.elapsed)
            )?;
            match update.outcome {
                Some(result) => writeln!(
                    f,
                    ": {} matched, {} modified",
                    result.matched.bold(),
                    result.modified.bold()
                )?,
                None => writeln!(f, ": {}", "FAILED".bold().red())?,
            }
            if let Some(read) = &update.verification {
                read_line(f, read)?;
            }
        }

        writeln!(
            f,
            "{} ({} inserts acknowledged)",
            "SERVERS:".bold().green(),
            outcome.inserts_succeeded.bold()
        )?;
        let tally = &outcome.tally;
        let servers: BTreeSet<_> = tally.writes.keys().chain(tally.reads.keys()).collect();
        for server in servers {
            let writes = tally.writes.get(server).copied().unwrap_or_default();
            let reads = tally.reads.get(server).copied().unwrap_or_default();
            writeln!(f, "  {server}: {writes} writes, {reads} reads")?;
        }

        if let Some(replica_set) = &outcome.replica_set {
            writeln!(
                f,
                "  primary: {}; secondaries: {}",
                replica_set.primary.as_deref().unwrap_or("none"),
                replica_set.secondaries.join(", ")
            )?;
        }
        if !outcome.indexes.is_empty() {
            writeln!(f, "  indexes: {}", outcome.indexes.join(", "))?;
        }

        if let Some(diagnostics) = &outcome.diagnostics {
            writeln!(f, "{}", "DIAGNOSTICS:".bold().green())?;
            match &diagnostics.plan {
                Some(plan) if plan.is_collection_scan() => {
                    writeln!(f, "  sorted read: {plan} {}", "NO INDEX".bold().yellow())?
                }
                Some(plan) => writeln!(f, "  sorted read: {plan}")?,
                None => writeln!(f, "  sorted read: {}", "NOT EXPLAINED".bold().red())?,
            }
            for index in &diagnostics.index_usage {
                writeln!(f, "  {}: {} accesses", index.name, index.accesses.bold())?;
            }
        }

        Ok(())
    }
}

fn write_phase(f: &mut fmt::Formatter<'_>, write: &WriteReport) -> fmt::Result {
    write!(
        f,
        "{} took {} for {} iterations",
        "WRITE:".bold().green(),
        seconds(write.elapsed),
        write.iterations.bold()
    )?;
    if write.failures > 0 {
        write!(
            f,
            ", {}",
            format!("{} FAILURES", write.failures).bold().red()
        )?;
    }
    writeln!(f)?;

    writeln!(
        f,
        "  {:.2} insertions/s; avg latency: {:.6}s",
        write.insertions_per_second.bold(),
        write.average_latency
    )?;
    if let (Some(p50), Some(p90), Some(p99)) = (write.p50, write.p90, write.p99) {
        writeln!(f, "  p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}")?;
    }
    Ok(())
}

fn read_line(f: &mut fmt::Formatter<'_>, read: &ReadReport) -> fmt::Result {
    match read.documents {
        Some(documents) => writeln!(
            f,
            "  {}: {} documents in {}",
            read.benchmark,
            documents.bold(),
            seconds(read.elapsed)
        ),
        None => writeln!(
            f,
            "  {}: {} after {}",
            read.benchmark,
            "FAILED".bold().red(),
            seconds(read.elapsed)
        ),
    }
}

fn seconds(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

/// Writes the summary to stderr and logs the headline numbers.
pub fn emit(outcome: &RunOutcome) {
    let write = &outcome.write;
    tracing::info!(
        strategy = %outcome.strategy,
        collection = %outcome.collection,
        iterations = write.iterations,
        failures = write.failures,
        elapsed = ?write.elapsed,
        insertions_per_second = write.insertions_per_second,
        average_latency = write.average_latency,
        writes = outcome.tally.total_writes(),
        reads = outcome.tally.total_reads(),
        cancelled = outcome.cancelled,
        "benchmark finished"
    );

    eprintln!();
    eprint!("{}", Summary(outcome));
}

/// Appends one JSON line per event to the log at `path`, creating it if needed.
pub fn persist(events: &[TopologyEvent], path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);

    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    tracing::debug!(count = events.len(), path = %path.display(), "persisted topology events");
    Ok(())
}

/// Reads back all events from a log written by [`persist`], in order.
pub fn read_event_log(path: &Path) -> io::Result<Vec<TopologyEvent>> {
    let reader = BufReader::new(File::open(path)?);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}
