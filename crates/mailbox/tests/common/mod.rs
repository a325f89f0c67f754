#![allow(dead_code)]

use std::time::Duration;

use courier_consensus_memory::{MemoryConsensus, MemoryConsensusConfig};
use courier_mailbox::{MailboxConfig, ReplicatedMailbox, TransactionManager};

pub type Manager = TransactionManager<MemoryConsensus>;
pub type Store = ReplicatedMailbox<MemoryConsensus>;

pub fn consensus() -> MemoryConsensus {
    MemoryConsensus::new(
        MemoryConsensusConfig::default().with_election_timeout(Duration::from_millis(20)),
    )
    .unwrap()
}

pub fn manager(consensus: MemoryConsensus) -> Manager {
    TransactionManager::new(consensus, MailboxConfig::default()).unwrap()
}

pub fn mailbox() -> (MemoryConsensus, Store) {
    let consensus = consensus();
    let store = ReplicatedMailbox::new(manager(consensus.clone()));
    (consensus, store)
}

/// Polls `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
