//! Per-user FIFO mailboxes stored in node clusters.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_consensus::Consensus;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BodyError, Error};
use crate::manager::TransactionManager;
use crate::state_machine::MailboxStateMachine;
use crate::types::{Key, NodeId, UserId};

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque payload.
    pub payload: Bytes,

    /// Enqueue time, milliseconds since the Unix epoch.
    pub enqueued_at: i64,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            enqueued_at: Utc::now().timestamp_millis(),
        }
    }

    /// Enqueue time, if representable.
    #[must_use]
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.enqueued_at)
    }
}

/// Acknowledgement of a successful put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSent {
    /// Queue length right after the put.
    pub queue_len: usize,
}

/// A store of per-user FIFO mailboxes, partitioned by node.
#[async_trait]
pub trait Mailbox: Clone + Send + Sync + 'static {
    /// Appends a message at the tail of the mailbox.
    async fn put(&self, node: &NodeId, user: &UserId, payload: Bytes) -> Result<MessageSent, Error>;

    /// Removes and returns the head of the mailbox.
    ///
    /// Each message is returned by exactly one successful call.
    async fn consume(&self, node: &NodeId, user: &UserId) -> Result<Message, Error>;

    /// Returns the head of the mailbox without removing it.
    async fn peek(&self, node: &NodeId, user: &UserId) -> Result<Message, Error>;

    /// Returns the number of queued messages.
    async fn count(&self, node: &NodeId, user: &UserId) -> Result<usize, Error>;
}

/// Mailbox stored in the replicated cluster of each node.
pub struct ReplicatedMailbox<C>
where
    C: Consensus<MailboxStateMachine>,
{
    manager: TransactionManager<C>,
}

impl<C> Clone for ReplicatedMailbox<C>
where
    C: Consensus<MailboxStateMachine>,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<C> std::fmt::Debug for ReplicatedMailbox<C>
where
    C: Consensus<MailboxStateMachine>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedMailbox")
            .field("manager", &self.manager)
            .finish()
    }
}

impl<C> ReplicatedMailbox<C>
where
    C: Consensus<MailboxStateMachine>,
{
    /// Creates a mailbox over `manager`.
    #[must_use]
    pub const fn new(manager: TransactionManager<C>) -> Self {
        Self { manager }
    }

    /// Returns the transaction manager.
    #[must_use]
    pub const fn manager(&self) -> &TransactionManager<C> {
        &self.manager
    }

    async fn read_queue(&self, node: &NodeId, user: &UserId) -> Result<VecDeque<Message>, Error> {
        let key = mailbox_key(user);

        let committed = self
            .manager
            .run_transaction(node, |scope| {
                scope.record_read(key.clone());
                Ok(())
            })
            .await?;

        decode_queue(committed.reads.value(&key)).map_err(Error::Codec)
    }
}

#[async_trait]
impl<C> Mailbox for ReplicatedMailbox<C>
where
    C: Consensus<MailboxStateMachine>,
{
    async fn put(&self, node: &NodeId, user: &UserId, payload: Bytes) -> Result<MessageSent, Error> {
        let key = mailbox_key(user);
        // Stamped once so retries enqueue the same message.
        let message = Message::new(payload);

        let sent = self
            .manager
            .read_modify_write(node, vec![key.clone()], |snapshot, scope| {
                let mut queue = decode_queue(snapshot.value(&key)).map_err(BodyError::Aborted)?;
                queue.push_back(message.clone());
                scope.set(key.clone(), encode_queue(&queue).map_err(BodyError::Aborted)?);
                Ok(MessageSent {
                    queue_len: queue.len(),
                })
            })
            .await?;

        debug!(%node, %user, queue_len = sent.queue_len, "message enqueued");
        Ok(sent)
    }

    async fn consume(&self, node: &NodeId, user: &UserId) -> Result<Message, Error> {
        let key = mailbox_key(user);

        let head = self
            .manager
            .read_modify_write(node, vec![key.clone()], |snapshot, scope| {
                let mut queue = decode_queue(snapshot.value(&key)).map_err(BodyError::Aborted)?;
                let Some(head) = queue.pop_front() else {
                    return Ok(None);
                };

                if queue.is_empty() {
                    scope.delete(key.clone());
                } else {
                    scope.set(key.clone(), encode_queue(&queue).map_err(BodyError::Aborted)?);
                }

                Ok(Some(head))
            })
            .await?;

        let message = head.ok_or(Error::Empty)?;
        debug!(%node, %user, "message consumed");
        Ok(message)
    }

    async fn peek(&self, node: &NodeId, user: &UserId) -> Result<Message, Error> {
        self.read_queue(node, user)
            .await?
            .pop_front()
            .ok_or(Error::Empty)
    }

    async fn count(&self, node: &NodeId, user: &UserId) -> Result<usize, Error> {
        Ok(self.read_queue(node, user).await?.len())
    }
}

/// Key of a user's mailbox inside its node cluster.
#[must_use]
pub fn mailbox_key(user: &UserId) -> Key {
    Key::new(format!("mailbox/{user}"))
}

fn encode_queue(queue: &VecDeque<Message>) -> Result<Bytes, String> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(queue, &mut buffer).map_err(|e| e.to_string())?;
    Ok(Bytes::from(buffer))
}

fn decode_queue(value: Option<&Bytes>) -> Result<VecDeque<Message>, String> {
    value.map_or_else(
        || Ok(VecDeque::new()),
        |bytes| ciborium::de::from_reader(bytes.as_ref()).map_err(|e| format!("corrupt mailbox: {e}")),
    )
}
