//! Passive bookkeeping of command and topology events.
//!
//! An [`Observer`] is handed to a [`Connector`](crate::Connector) before the store handle exists,
//! so every command the store issues is seen. Callbacks only bump counters or append to a list;
//! they never fail and never touch the command itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Per-connection operation counts, split into writes and reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTally {
    /// Insert commands started, by connection.
    pub writes: BTreeMap<String, u64>,
    /// Find commands started, by connection.
    pub reads: BTreeMap<String, u64>,
}

impl ServerTally {
    /// Sum of all write counts.
    pub fn total_writes(&self) -> u64 {
        self.writes.values().sum()
    }

    /// Sum of all read counts.
    pub fn total_reads(&self) -> u64 {
        self.reads.values().sum()
    }
}

/// A change in the description of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEvent {
    /// When the event was received.
    pub observed_at: SystemTime,
    /// Address of the member, `host:port`.
    pub address: String,
    /// Description of the member before the change.
    pub previous: String,
    /// Description of the member after the change.
    pub new: String,
}

impl TopologyEvent {
    /// Creates an event observed now.
    pub fn new(
        address: impl Into<String>,
        previous: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        Self {
            observed_at: SystemTime::now(),
            address: address.into(),
            previous: previous.into(),
            new: new.into(),
        }
    }
}

impl fmt::Display for TopologyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.address, self.previous, self.new)
    }
}

/// The kind of command an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `insert`
    Insert,
    /// `find`
    Find,
    /// Anything else, e.g. `update`, `createIndexes` or handshakes.
    Other,
}

impl CommandKind {
    /// Classifies a wire command name.
    pub fn from_name(command_name: &str) -> Self {
        match command_name {
            "insert" => Self::Insert,
            "find" => Self::Find,
            _ => Self::Other,
        }
    }
}

/// Tallies commands per connection and records topology changes.
///
/// Cheap to clone; all clones share the same state. Safe to call from the driver's internal
/// threads concurrently.
#[derive(Clone, Debug, Default)]
pub struct Observer(Arc<ObserverInner>);

#[derive(Debug, Default)]
struct ObserverInner {
    tally: Mutex<ServerTally>,
    inserts_succeeded: AtomicU64,
    topology: Mutex<Vec<TopologyEvent>>,
}

impl Observer {
    /// Creates an observer with empty tallies.
    pub fn new() -> Self {
        Self::default()
    }

    /// A command was sent on `connection`.
    pub fn command_started(&self, command_name: &str, connection: &str) {
        let kind = CommandKind::from_name(command_name);
        let mut tally = match kind {
            CommandKind::Other => return,
            _ => lock(&self.0.tally, "server tally"),
        };

        let counts = match kind {
            CommandKind::Insert => &mut tally.writes,
            _ => &mut tally.reads,
        };
        match counts.get_mut(connection) {
            Some(count) => *count += 1,
            None => {
                counts.insert(connection.to_owned(), 1);
            }
        }
    }

    /// A command sent on `connection` succeeded.
    pub fn command_succeeded(&self, command_name: &str, _connection: &str) {
        if CommandKind::from_name(command_name) == CommandKind::Insert {
            self.0.inserts_succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A command sent on `connection` failed.
    ///
    /// Failures are counted by whoever issued the command, this hook only traces them.
    pub fn command_failed(&self, command_name: &str, connection: &str, failure: &dyn fmt::Display) {
        tracing::trace!(command_name, connection, %failure, "command failed");
    }

    /// The description of a cluster member changed.
    pub fn server_description_changed(&self, event: TopologyEvent) {
        tracing::debug!(%event, "server description changed");
        lock(&self.0.topology, "topology log").push(event);
    }

    /// A copy of the current per-connection tallies.
    pub fn tally(&self) -> ServerTally {
        lock(&self.0.tally, "server tally").clone()
    }

    /// Number of insert commands that completed successfully.
    pub fn inserts_succeeded(&self) -> u64 {
        self.0.inserts_succeeded.load(Ordering::Relaxed)
    }

    /// All topology events in the order they were received.
    pub fn topology_events(&self) -> Vec<TopologyEvent> {
        lock(&self.0.topology, "topology log").clone()
    }
}

/// Locks `mutex`, recovering the data if another callback panicked while holding it.
fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(what, "observer state was poisoned, recovering");
        poisoned.into_inner()
    })
}
