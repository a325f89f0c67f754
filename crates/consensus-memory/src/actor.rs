//! Cluster actor: owns the command log and every replica of one cluster.
//!
//! All requests for a cluster are processed one at a time by this task, which
//! gives the log its single total order.

use bytes::Bytes;
use courier_consensus::{ClusterName, StateMachine};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::cluster::{ClusterStatus, ReplicaDigest, ReplicaStatus};
use crate::{Error, MemoryConsensusConfig, ReplicaId};

pub(crate) enum Request<M: StateMachine> {
    Propose {
        command: M::Command,
        reply: oneshot::Sender<Result<M::Output, Error>>,
    },
    Crash {
        replica: ReplicaId,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Restart {
        replica: ReplicaId,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Status {
        reply: oneshot::Sender<ClusterStatus>,
    },
    Digests {
        reply: oneshot::Sender<Result<Vec<ReplicaDigest>, Error>>,
    },
}

struct LogEntry {
    index: u64,
    term: u64,
    payload: Bytes,
}

struct Snapshot {
    last_index: u64,
    last_term: u64,
    state: Bytes,
}

struct Replica<S> {
    id: ReplicaId,
    alive: bool,
    state: S,
    applied: u64,
}

pub(crate) struct ClusterActor<M: StateMachine> {
    name: ClusterName,
    machine: M,
    config: MemoryConsensusConfig,
    term: u64,
    leader: Option<ReplicaId>,
    election_deadline: Option<Instant>,
    commit_index: u64,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    replicas: Vec<Replica<M::State>>,
}

impl<M: StateMachine> ClusterActor<M> {
    pub(crate) fn new(name: ClusterName, machine: M, config: MemoryConsensusConfig) -> Self {
        let replicas = (1..=config.replicas as u64)
            .map(|id| Replica {
                id: ReplicaId(id),
                alive: true,
                state: M::State::default(),
                applied: 0,
            })
            .collect();

        Self {
            name,
            machine,
            config,
            term: 1,
            leader: Some(ReplicaId(1)),
            election_deadline: None,
            commit_index: 0,
            log: Vec::new(),
            snapshot: None,
            replicas,
        }
    }

    pub(crate) async fn run(mut self, mut receiver: mpsc::Receiver<Request<M>>) {
        info!(cluster = %self.name, replicas = self.replicas.len(), "cluster started");

        loop {
            let deadline = self.election_deadline;

            tokio::select! {
                request = receiver.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    self.handle(request).await;
                }
                () = async move {
                    match deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.run_election();
                }
            }
        }

        debug!(cluster = %self.name, "cluster stopped, all handles dropped");
    }

    async fn handle(&mut self, request: Request<M>) {
        match request {
            Request::Propose { command, reply } => {
                let result = self.propose(command).await;
                if reply.send(result).is_err() {
                    // The proposer gave up; the outcome stands regardless.
                    debug!(cluster = %self.name, "proposer dropped before reply");
                }
            }
            Request::Crash { replica, reply } => {
                let _ = reply.send(self.crash(replica));
            }
            Request::Restart { replica, reply } => {
                let _ = reply.send(self.restart(replica));
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Request::Digests { reply } => {
                let _ = reply.send(self.digests());
            }
        }
    }

    fn quorum(&self) -> usize {
        self.config.quorum()
    }

    fn alive(&self) -> usize {
        self.replicas.iter().filter(|r| r.alive).count()
    }

    fn replica_index(&self, id: ReplicaId) -> Result<usize, Error> {
        self.replicas
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::UnknownReplica(id))
    }

    async fn propose(&mut self, command: M::Command) -> Result<M::Output, Error> {
        let Some(leader) = self.leader else {
            return Err(Error::NoLeader);
        };

        let alive = self.alive();
        let required = self.quorum();
        if alive < required {
            warn!(cluster = %self.name, alive, required, "proposal rejected, no quorum");
            return Err(Error::NotCommitted { alive, required });
        }

        let payload = encode(&command)?;

        if !self.config.commit_latency.is_zero() {
            tokio::time::sleep(self.config.commit_latency).await;
        }

        let index = self.commit_index + 1;
        self.log.push(LogEntry {
            index,
            term: self.term,
            payload,
        });
        self.commit_index = index;

        trace!(cluster = %self.name, index, term = self.term, "entry committed");

        let mut output = None;
        for replica in self.replicas.iter_mut().filter(|r| r.alive) {
            let result = apply(&self.machine, replica, index, command.clone());
            if replica.id == leader {
                output = Some(result);
            }
        }

        if let Err(e) = self.maybe_snapshot(leader) {
            error!(cluster = %self.name, index, "snapshot failed: {e}");
        }

        output.ok_or_else(|| Error::Codec(format!("leader {leader} did not apply entry {index}")))
    }

    fn maybe_snapshot(&mut self, leader: ReplicaId) -> Result<(), Error> {
        let last_index = self.snapshot.as_ref().map_or(0, |s| s.last_index);
        if self.commit_index - last_index < self.config.snapshot_interval {
            return Ok(());
        }

        let position = self.replica_index(leader)?;
        let state = encode(&self.replicas[position].state)?;
        let commit_index = self.commit_index;

        self.log.retain(|entry| entry.index > commit_index);
        self.snapshot = Some(Snapshot {
            last_index: commit_index,
            last_term: self.term,
            state,
        });

        debug!(cluster = %self.name, index = commit_index, "snapshot taken, log compacted");

        Ok(())
    }

    fn crash(&mut self, id: ReplicaId) -> Result<(), Error> {
        let position = self.replica_index(id)?;
        self.replicas[position].alive = false;

        warn!(cluster = %self.name, replica = %id, "replica crashed");

        if self.leader == Some(id) {
            self.leader = None;
            self.schedule_election();
        }

        Ok(())
    }

    fn restart(&mut self, id: ReplicaId) -> Result<(), Error> {
        let position = self.replica_index(id)?;
        if self.replicas[position].alive {
            return Ok(());
        }

        self.catch_up(position)?;
        self.replicas[position].alive = true;

        info!(
            cluster = %self.name,
            replica = %id,
            applied = self.replicas[position].applied,
            "replica restarted"
        );

        if self.leader.is_none() && self.election_deadline.is_none() {
            self.schedule_election();
        }

        Ok(())
    }

    /// Brings a replica up to the commit index from the snapshot and the log.
    fn catch_up(&mut self, position: usize) -> Result<(), Error> {
        let replica = &mut self.replicas[position];

        if let Some(snapshot) = &self.snapshot {
            if replica.applied < snapshot.last_index {
                replica.state = decode(&snapshot.state)?;
                replica.applied = snapshot.last_index;
                debug!(
                    cluster = %self.name,
                    replica = %replica.id,
                    index = snapshot.last_index,
                    term = snapshot.last_term,
                    "snapshot installed"
                );
            }
        }

        let from = replica.applied;
        for entry in self.log.iter().filter(|e| e.index > from) {
            let command: M::Command = decode(&entry.payload)?;
            apply(&self.machine, replica, entry.index, command);
            trace!(
                cluster = %self.name,
                replica = %replica.id,
                index = entry.index,
                term = entry.term,
                "entry replayed"
            );
        }

        Ok(())
    }

    fn schedule_election(&mut self) {
        self.election_deadline = Some(Instant::now() + self.config.election_timeout);
    }

    fn run_election(&mut self) {
        self.election_deadline = None;

        let alive = self.alive();
        let required = self.quorum();
        if alive < required {
            warn!(cluster = %self.name, alive, required, "election failed, no quorum");
            return;
        }

        // Most up-to-date live replica wins, lowest id breaks ties.
        let winner = self
            .replicas
            .iter()
            .filter(|r| r.alive)
            .max_by(|a, b| a.applied.cmp(&b.applied).then(b.id.cmp(&a.id)))
            .map(|r| r.id);

        if let Some(winner) = winner {
            self.term += 1;
            self.leader = Some(winner);
            info!(cluster = %self.name, leader = %winner, term = self.term, "leader elected");
        }
    }

    fn status(&self) -> ClusterStatus {
        ClusterStatus {
            name: self.name.clone(),
            leader: self.leader,
            term: self.term,
            commit_index: self.commit_index,
            snapshot_index: self.snapshot.as_ref().map(|s| s.last_index),
            replicas: self
                .replicas
                .iter()
                .map(|r| ReplicaStatus {
                    id: r.id,
                    alive: r.alive,
                    applied: r.applied,
                })
                .collect(),
        }
    }

    fn digests(&self) -> Result<Vec<ReplicaDigest>, Error> {
        self.replicas
            .iter()
            .filter(|r| r.alive)
            .map(|r| {
                let bytes = encode(&r.state)?;
                Ok(ReplicaDigest {
                    id: r.id,
                    applied: r.applied,
                    digest: hex::encode(Sha256::digest(&bytes)),
                })
            })
            .collect()
    }
}

fn apply<M: StateMachine>(
    machine: &M,
    replica: &mut Replica<M::State>,
    index: u64,
    command: M::Command,
) -> M::Output {
    let state = std::mem::take(&mut replica.state);
    let (state, output) = machine.apply(state, command);
    replica.state = state;
    replica.applied = index;
    output
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, Error> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer).map_err(|e| {
        error!("failed to encode log data: {e}");
        Error::Codec(e.to_string())
    })?;
    Ok(Bytes::from(buffer))
}

fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, Error> {
    ciborium::de::from_reader(&bytes[..]).map_err(|e| {
        error!("failed to decode log data: {e}");
        Error::Codec(e.to_string())
    })
}
