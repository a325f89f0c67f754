//! Abstract interface for replicated state machines.
//!
//! A consensus substrate orders commands into a single log per cluster and
//! applies every committed command, in log order, to a deterministic
//! [`StateMachine`] on each replica. This crate only describes that contract;
//! implementations live in their own crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod name;

pub use name::{ClusterName, InvalidClusterName, MAX_CLUSTER_NAME_LEN, is_safe_char};

use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Broad classification of substrate failures.
///
/// Callers use this to decide whether a failure is worth retrying without
/// knowing the concrete error type of the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The substrate cannot create clusters right now.
    Unavailable,

    /// A cluster with the requested name already exists.
    AlreadyExists,

    /// No leader is known; typically seen during a failover window.
    NoLeader,

    /// The caller stopped waiting. The command may still commit.
    Timeout,

    /// The command was not accepted by a quorum and had no effect.
    NotCommitted,

    /// The cluster has been shut down.
    Shutdown,

    /// Anything else (codec failures, invalid configuration).
    Internal,
}

impl FailureKind {
    /// Whether retrying the same call later can reasonably succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::NoLeader | Self::Timeout | Self::NotCommitted)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NoLeader => write!(f, "no leader"),
            Self::Timeout => write!(f, "timeout"),
            Self::NotCommitted => write!(f, "not committed"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Marker trait for substrate errors.
pub trait ConsensusError: Debug + Error + Send + Sync + 'static {
    /// Classifies the failure.
    fn kind(&self) -> FailureKind;

    /// Whether retrying the same call later can reasonably succeed.
    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// A deterministic state machine driven by a replicated command log.
///
/// `apply` must be a pure function of its inputs: the same command applied to
/// the same state must produce a byte-identical state on every replica. No
/// I/O, randomness or clock reads are allowed; anything time-dependent has to
/// be embedded in the command by the proposer.
pub trait StateMachine: Clone + Debug + Send + Sync + 'static {
    /// Commands carried by the log.
    type Command: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Result handed back to the proposer once its command is applied.
    type Output: Clone + Debug + Send + Sync + 'static;

    /// The replicated state.
    type State: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Applies one committed command.
    fn apply(&self, state: Self::State, command: Self::Command) -> (Self::State, Self::Output);
}

/// Handle to one replicated cluster.
///
/// Handles are cheap to clone and shared between every caller targeting the
/// same cluster. All mutation goes through [`Cluster::propose`].
#[async_trait]
pub trait Cluster<M>: Clone + Debug + Send + Sync + 'static
where
    M: StateMachine,
{
    /// The error type for proposals.
    type Error: ConsensusError;

    /// Name the cluster was created under.
    fn name(&self) -> &ClusterName;

    /// Proposes a command and waits for it to be committed and applied.
    ///
    /// On success the command has been accepted by a quorum and applied; the
    /// returned output is the state machine's result for it. A
    /// [`FailureKind::Timeout`] error does not imply the command was dropped.
    async fn propose(
        &self,
        command: M::Command,
        timeout: Duration,
    ) -> Result<M::Output, Self::Error>;
}

/// A consensus substrate able to create isolated clusters.
#[async_trait]
pub trait Consensus<M>: Clone + Send + Sync + 'static
where
    M: StateMachine,
{
    /// The error type for the substrate.
    type Error: ConsensusError;

    /// The cluster handle type.
    type Cluster: Cluster<M, Error = Self::Error>;

    /// Creates a new cluster running `machine` from its default state.
    ///
    /// Two clusters never share state, even when created from clones of the
    /// same machine.
    async fn create_cluster(
        &self,
        name: ClusterName,
        machine: M,
    ) -> Result<Self::Cluster, Self::Error>;
}
