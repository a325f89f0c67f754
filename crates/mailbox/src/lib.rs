//! Replicated, linearizable per-user mailboxes.
//!
//! Every node id owns a dedicated cluster of the consensus substrate, created
//! on first use by the [`ClusterRegistry`]. Operations run as transactions:
//! a read-set, optional version guards and a write-set proposed as one log
//! command and applied by the deterministic [`MailboxStateMachine`] on every
//! replica. The [`TransactionManager`] turns caller logic into such commands,
//! and [`ReplicatedMailbox`] builds FIFO queues with exactly-once
//! consumption on top of it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod context;
mod error;
mod mailbox;
mod manager;
pub mod protocol;
mod registry;
mod state_machine;
mod types;

pub use config::{MAX_PREFIX_LEN, MailboxConfig};
pub use context::{TransactionContext, TransactionScope};
pub use error::{BodyError, Error};
pub use mailbox::{Mailbox, Message, MessageSent, ReplicatedMailbox, mailbox_key};
pub use manager::{Committed, ManagerStats, TransactionBody, TransactionManager};
pub use registry::{ClusterRegistry, cluster_name};
pub use state_machine::{
    ApplyCounters, ApplyResult, ApplyStatus, MailboxStateMachine, ReplicatedState, Transaction,
};
pub use types::{Guard, Key, NodeId, ReadResult, ReadResults, UserId, Versioned, WriteOp};
