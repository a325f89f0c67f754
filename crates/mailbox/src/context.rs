//! The scope transaction bodies stage their reads and writes into.

use bytes::Bytes;

use crate::state_machine::Transaction;
use crate::types::{Guard, Key, WriteOp};

/// What a transaction body can do.
///
/// Reads are only recorded here; their values become available once the
/// transaction has committed.
pub trait TransactionScope {
    /// Requests the pre-write value of `key`.
    fn record_read(&mut self, key: Key);

    /// Stages a write of `value` to `key`.
    fn set(&mut self, key: Key, value: Bytes);

    /// Stages a removal of `key`.
    fn delete(&mut self, key: Key);

    /// Requires `key` to be at `version` (`None`: absent) when the
    /// transaction applies.
    fn expect_version(&mut self, key: Key, version: Option<u64>);

    /// Keys recorded so far, including those of earlier coordinated bodies.
    fn reads(&self) -> &[Key];
}

/// Builder for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    reads: Vec<Key>,
    writes: Vec<WriteOp>,
    guards: Vec<Guard>,
}

impl TransactionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Staged writes, in order.
    #[must_use]
    pub fn writes(&self) -> &[WriteOp] {
        &self.writes
    }

    /// Staged guards.
    #[must_use]
    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// Whether no write has been staged.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Converts the context into a command.
    #[must_use]
    pub fn into_transaction(self) -> Transaction {
        Transaction::new(self.reads, self.writes).with_guards(self.guards)
    }
}

impl TransactionScope for TransactionContext {
    fn record_read(&mut self, key: Key) {
        self.reads.push(key);
    }

    fn set(&mut self, key: Key, value: Bytes) {
        self.writes.push(WriteOp::Set { key, value });
    }

    fn delete(&mut self, key: Key) {
        self.writes.push(WriteOp::Delete { key });
    }

    fn expect_version(&mut self, key: Key, version: Option<u64>) {
        self.guards.push(Guard::Version {
            key,
            expected: version,
        });
    }

    fn reads(&self) -> &[Key] {
        &self.reads
    }
}
