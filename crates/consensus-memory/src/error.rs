use std::time::Duration;

use courier_consensus::{ClusterName, ConsensusError, FailureKind};
use thiserror::Error;

use crate::ReplicaId;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster creation is currently disabled.
    #[error("consensus substrate unavailable")]
    Unavailable,

    /// A cluster with this name was already created.
    #[error("cluster {0} already exists")]
    ClusterExists(ClusterName),

    /// No replica currently leads the cluster.
    #[error("no leader")]
    NoLeader,

    /// Not enough live replicas to form a quorum.
    #[error("not committed: {alive} live replicas, {required} required")]
    NotCommitted {
        /// Live replicas at proposal time.
        alive: usize,
        /// Quorum size.
        required: usize,
    },

    /// The proposer stopped waiting.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The cluster actor has stopped.
    #[error("cluster shut down")]
    Shutdown,

    /// No replica with this id exists in the cluster.
    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),

    /// A log entry or snapshot failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsensusError for Error {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable => FailureKind::Unavailable,
            Self::ClusterExists(_) => FailureKind::AlreadyExists,
            Self::NoLeader => FailureKind::NoLeader,
            Self::NotCommitted { .. } => FailureKind::NotCommitted,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Shutdown => FailureKind::Shutdown,
            Self::UnknownReplica(_) | Self::Codec(_) | Self::InvalidConfig(_) => {
                FailureKind::Internal
            }
        }
    }
}
