//! The deterministic key/value state machine replicated by every node
//! cluster.
//!
//! One [`Transaction`] is one log command: its reads and guards see the state
//! as it was before the command, and its writes land together or not at all.

use std::collections::BTreeMap;

use courier_consensus::StateMachine;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Guard, Key, ReadResult, ReadResults, Versioned, WriteOp};

/// A command: read-set, guards and write-set applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Keys to read, in request order.
    pub reads: Vec<Key>,

    /// Writes, applied in order.
    pub writes: Vec<WriteOp>,

    /// Preconditions; any failing guard cancels every write.
    pub guards: Vec<Guard>,
}

impl Transaction {
    /// Creates an unguarded transaction.
    #[must_use]
    pub const fn new(reads: Vec<Key>, writes: Vec<WriteOp>) -> Self {
        Self {
            reads,
            writes,
            guards: Vec::new(),
        }
    }

    /// Adds guards.
    #[must_use]
    pub fn with_guards(mut self, guards: Vec<Guard>) -> Self {
        self.guards = guards;
        self
    }
}

/// Outcome of applying a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyStatus {
    /// Every write was applied.
    Applied,

    /// A guard failed; no write was applied.
    Conflict {
        /// Key of the first failing guard.
        key: Key,
    },
}

/// Result returned to the proposer of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Pre-write values of the requested keys.
    pub reads: ReadResults,

    /// Whether the writes were applied.
    pub status: ApplyStatus,
}

/// Counters kept inside the replicated state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounters {
    /// Commands applied, conflicting ones included.
    pub transactions_applied: u64,

    /// `Set` and `Delete` operations applied.
    pub writes_applied: u64,

    /// Writes skipped because their kind is unknown.
    pub unknown_writes_ignored: u64,

    /// Commands cancelled by a failing guard.
    pub conflicts: u64,
}

/// Replicated key/value state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedState {
    entries: BTreeMap<Key, Versioned>,
    revision: u64,
    counters: ApplyCounters,
}

impl ReplicatedState {
    /// Current entry for `key`.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Versioned> {
        self.entries.get(key)
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Revision of the last command that wrote anything.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Apply counters.
    #[must_use]
    pub const fn counters(&self) -> &ApplyCounters {
        &self.counters
    }

    fn guard_holds(&self, guard: &Guard) -> bool {
        match guard {
            Guard::Version { key, expected } => {
                self.entries.get(key).map(|entry| entry.version) == *expected
            }
        }
    }
}

/// The mailbox state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxStateMachine;

impl StateMachine for MailboxStateMachine {
    type Command = Transaction;
    type Output = ApplyResult;
    type State = ReplicatedState;

    fn apply(&self, mut state: ReplicatedState, command: Transaction) -> (ReplicatedState, ApplyResult) {
        let reads = ReadResults::new(
            command
                .reads
                .into_iter()
                .map(|key| {
                    let value = state.entries.get(&key).cloned();
                    ReadResult { key, value }
                })
                .collect(),
        );

        state.counters.transactions_applied += 1;

        if let Some(failed) = command.guards.iter().find(|g| !state.guard_holds(g)) {
            state.counters.conflicts += 1;
            let status = ApplyStatus::Conflict {
                key: failed.key().clone(),
            };
            return (state, ApplyResult { reads, status });
        }

        let revision = state.revision + 1;
        let mut wrote = false;

        for write in command.writes {
            match write {
                WriteOp::Set { key, value } => {
                    state.entries.insert(
                        key,
                        Versioned {
                            value,
                            version: revision,
                        },
                    );
                }
                WriteOp::Delete { key } => {
                    state.entries.remove(&key);
                }
                WriteOp::Unknown => {
                    warn!(revision, "ignoring write of unknown kind");
                    state.counters.unknown_writes_ignored += 1;
                    continue;
                }
            }
            state.counters.writes_applied += 1;
            wrote = true;
        }

        if wrote {
            state.revision = revision;
        }

        let status = ApplyStatus::Applied;
        (state, ApplyResult { reads, status })
    }
}
