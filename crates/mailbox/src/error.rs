//! Error types for the mailbox store.

use courier_consensus::{ConsensusError, FailureKind};
use thiserror::Error;

use crate::types::NodeId;

/// Failure reported by a transaction body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BodyError {
    /// The body chose to abort.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The body panicked; the panic was caught at the manager boundary.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl BodyError {
    /// Aborts with a reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }
}

/// Errors that can occur in the mailbox store.
#[derive(Debug, Error)]
pub enum Error {
    /// The node's cluster could not be created.
    #[error("cluster for node {node} unavailable: {reason}")]
    Cluster {
        /// Node whose cluster was requested.
        node: NodeId,
        /// Substrate message.
        reason: String,
    },

    /// A proposal failed.
    #[error("consensus failure ({kind}): {reason}")]
    Consensus {
        /// Failure classification.
        kind: FailureKind,
        /// Substrate message.
        reason: String,
    },

    /// The mailbox holds no message.
    #[error("mailbox is empty")]
    Empty,

    /// The transaction body failed; nothing was submitted.
    #[error("transaction body failed: {0}")]
    Body(BodyError),

    /// One or more coordinated bodies failed; nothing was submitted.
    #[error("{} coordinated bodies failed", .0.len())]
    Bodies(Vec<BodyError>),

    /// The committed result did not have the expected shape.
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),

    /// Optimistic retries were exhausted.
    #[error("transaction conflicted after {attempts} attempts")]
    Conflict {
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The transaction manager was shut down.
    #[error("transaction manager is shut down")]
    Shutdown,
}

impl Error {
    pub(crate) fn consensus<E: ConsensusError>(error: &E) -> Self {
        Self::Consensus {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }

    /// Whether retrying the same operation later can reasonably succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Consensus { kind, .. } => kind.is_retryable(),
            Self::Body(_) | Self::Bodies(_) | Self::Conflict { .. } => true,
            _ => false,
        }
    }
}
