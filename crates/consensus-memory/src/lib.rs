//! In-memory (single process) implementation of the consensus substrate for
//! local development and tests.
//!
//! Each cluster is a Tokio task owning a command log and a fixed set of
//! replicas. Committed commands are applied to every live replica; a crashed
//! leader opens an election window, and restarted replicas catch up from the
//! latest snapshot and the log suffix.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod actor;
mod cluster;
mod config;
mod error;

pub use cluster::{ClusterStatus, MemoryCluster, ReplicaDigest, ReplicaStatus};
pub use config::MemoryConsensusConfig;
pub use error::Error;

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_consensus::{ClusterName, Consensus, StateMachine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use actor::ClusterActor;

/// Identifier of a replica within one cluster, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// In-memory consensus substrate.
#[derive(Clone, Debug)]
pub struct MemoryConsensus {
    config: MemoryConsensusConfig,
    names: Arc<Mutex<HashSet<ClusterName>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryConsensus {
    fn default() -> Self {
        Self {
            config: MemoryConsensusConfig::default(),
            names: Arc::new(Mutex::new(HashSet::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryConsensus {
    /// Creates a new `MemoryConsensus`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is rejected.
    pub fn new(config: MemoryConsensusConfig) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MemoryConsensusConfig {
        &self.config
    }

    /// Enables or disables cluster creation. Existing clusters are unaffected.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of clusters created so far.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.names.lock().len()
    }
}

#[async_trait]
impl<M: StateMachine> Consensus<M> for MemoryConsensus {
    type Error = Error;
    type Cluster = MemoryCluster<M>;

    async fn create_cluster(&self, name: ClusterName, machine: M) -> Result<Self::Cluster, Error> {
        if !self.available.load(Ordering::SeqCst) {
            warn!(cluster = %name, "cluster creation refused, substrate unavailable");
            return Err(Error::Unavailable);
        }

        if !self.names.lock().insert(name.clone()) {
            return Err(Error::ClusterExists(name));
        }

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        let actor = ClusterActor::new(name.clone(), machine, self.config.clone());
        tokio::spawn(actor.run(receiver));

        debug!(cluster = %name, "cluster created");

        Ok(MemoryCluster::new(name, sender))
    }
}
