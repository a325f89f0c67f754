use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use courier_consensus::{Cluster, ClusterName, StateMachine};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::actor::Request;
use crate::{Error, ReplicaId};

/// Point-in-time view of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Replica id.
    pub id: ReplicaId,

    /// Whether the replica is running.
    pub alive: bool,

    /// Index of the last entry applied by this replica.
    pub applied: u64,
}

/// Point-in-time view of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Cluster name.
    pub name: ClusterName,

    /// Current leader, if any.
    pub leader: Option<ReplicaId>,

    /// Current term.
    pub term: u64,

    /// Index of the last committed entry.
    pub commit_index: u64,

    /// Last index covered by the latest snapshot.
    pub snapshot_index: Option<u64>,

    /// Every replica, live or not.
    pub replicas: Vec<ReplicaStatus>,
}

/// Digest of a live replica's serialized state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDigest {
    /// Replica id.
    pub id: ReplicaId,

    /// Index of the last entry applied by this replica.
    pub applied: u64,

    /// Hex-encoded SHA-256 of the replica's state.
    pub digest: String,
}

/// Handle to an in-memory cluster.
pub struct MemoryCluster<M: StateMachine> {
    name: ClusterName,
    sender: mpsc::Sender<Request<M>>,
}

impl<M: StateMachine> Clone for MemoryCluster<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<M: StateMachine> Debug for MemoryCluster<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<M: StateMachine> MemoryCluster<M> {
    pub(crate) const fn new(name: ClusterName, sender: mpsc::Sender<Request<M>>) -> Self {
        Self { name, sender }
    }

    async fn call<T: Send>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request<M> + Send,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();

        self.sender
            .send(request(reply))
            .await
            .map_err(|_| Error::Shutdown)?;

        response.await.map_err(|_| Error::Shutdown)
    }

    /// Stops a replica. Crashing the leader starts an election window during
    /// which proposals fail with [`Error::NoLeader`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownReplica`] for an id outside the cluster.
    pub async fn crash_replica(&self, replica: ReplicaId) -> Result<(), Error> {
        self.call(|reply| Request::Crash { replica, reply }).await?
    }

    /// Restarts a replica, catching it up from the snapshot and the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownReplica`] for an id outside the cluster, or a
    /// codec error if catch-up fails.
    pub async fn restart_replica(&self, replica: ReplicaId) -> Result<(), Error> {
        self.call(|reply| Request::Restart { replica, reply }).await?
    }

    /// Returns the current cluster status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the cluster has stopped.
    pub async fn status(&self) -> Result<ClusterStatus, Error> {
        self.call(|reply| Request::Status { reply }).await
    }

    /// Returns the current leader, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the cluster has stopped.
    pub async fn leader(&self) -> Result<Option<ReplicaId>, Error> {
        Ok(self.status().await?.leader)
    }

    /// Returns a state digest for every live replica.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the cluster has stopped, or a codec
    /// error if a state fails to serialize.
    pub async fn replica_digests(&self) -> Result<Vec<ReplicaDigest>, Error> {
        self.call(|reply| Request::Digests { reply }).await?
    }
}

#[async_trait]
impl<M: StateMachine> Cluster<M> for MemoryCluster<M> {
    type Error = Error;

    fn name(&self) -> &ClusterName {
        &self.name
    }

    async fn propose(&self, command: M::Command, timeout: Duration) -> Result<M::Output, Error> {
        let proposal = self.call(|reply| Request::Propose { command, reply });

        match tokio::time::timeout(timeout, proposal).await {
            Ok(result) => result?,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}
