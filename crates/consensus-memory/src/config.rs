use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Configuration shared by every cluster of a [`MemoryConsensus`](crate::MemoryConsensus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConsensusConfig {
    /// Replicas per cluster.
    pub replicas: usize,

    /// Delay between losing a leader and electing a new one.
    pub election_timeout: Duration,

    /// Simulated replication delay added to every commit.
    pub commit_latency: Duration,

    /// Committed entries between two snapshots.
    pub snapshot_interval: u64,

    /// Capacity of each cluster's request channel.
    pub channel_capacity: usize,
}

impl Default for MemoryConsensusConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            election_timeout: Duration::from_millis(150),
            commit_latency: Duration::ZERO,
            snapshot_interval: 1000,
            channel_capacity: 1024,
        }
    }
}

impl MemoryConsensusConfig {
    /// Sets the number of replicas per cluster.
    #[must_use]
    pub const fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Sets the election timeout.
    #[must_use]
    pub const fn with_election_timeout(mut self, election_timeout: Duration) -> Self {
        self.election_timeout = election_timeout;
        self
    }

    /// Sets the simulated commit latency.
    #[must_use]
    pub const fn with_commit_latency(mut self, commit_latency: Duration) -> Self {
        self.commit_latency = commit_latency;
        self
    }

    /// Sets the snapshot interval.
    #[must_use]
    pub const fn with_snapshot_interval(mut self, snapshot_interval: u64) -> Self {
        self.snapshot_interval = snapshot_interval;
        self
    }

    /// Number of live replicas needed to commit.
    #[must_use]
    pub const fn quorum(&self) -> usize {
        self.replicas / 2 + 1
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.replicas == 0 {
            return Err(Error::InvalidConfig(
                "a cluster needs at least one replica".to_string(),
            ));
        }

        if self.snapshot_interval == 0 {
            return Err(Error::InvalidConfig(
                "snapshot interval must be positive".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
