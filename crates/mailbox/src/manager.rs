//! Runs caller logic as transactions against node clusters.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use courier_consensus::Consensus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::context::{TransactionContext, TransactionScope};
use crate::error::{BodyError, Error};
use crate::protocol;
use crate::registry::ClusterRegistry;
use crate::state_machine::{ApplyResult, ApplyStatus, MailboxStateMachine};
use crate::types::{Key, NodeId, ReadResults};

/// A boxed transaction body, as passed to
/// [`TransactionManager::coordinate_transaction`].
pub type TransactionBody<T> =
    Box<dyn FnOnce(&mut dyn TransactionScope) -> Result<T, BodyError> + Send>;

/// A committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    /// What the body returned.
    pub value: T,

    /// Pre-write values of the keys the body recorded.
    pub reads: ReadResults,
}

/// Snapshot of the manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Transactions started.
    pub started: u64,

    /// Transactions committed.
    pub committed: u64,

    /// Transactions whose body failed.
    pub aborted: u64,

    /// Transactions that failed in the registry or the substrate.
    pub failed: u64,

    /// Guarded submissions rejected by a failing guard.
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

struct Inner<C>
where
    C: Consensus<MailboxStateMachine>,
{
    registry: Arc<ClusterRegistry<C>>,
    config: MailboxConfig,
    counters: Counters,
    closed: AtomicBool,
}

/// Builds transactions from caller logic and submits them to the cluster of
/// the target node.
///
/// Cheap to clone; clones share the registry and counters.
pub struct TransactionManager<C>
where
    C: Consensus<MailboxStateMachine>,
{
    inner: Arc<Inner<C>>,
}

impl<C> Clone for TransactionManager<C>
where
    C: Consensus<MailboxStateMachine>,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> std::fmt::Debug for TransactionManager<C>
where
    C: Consensus<MailboxStateMachine>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<C> TransactionManager<C>
where
    C: Consensus<MailboxStateMachine>,
{
    /// Creates a manager with its own registry over `consensus`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is rejected.
    pub fn new(consensus: C, config: MailboxConfig) -> Result<Self, Error> {
        let registry = Arc::new(ClusterRegistry::new(
            consensus,
            config.cluster_prefix.clone(),
        ));
        Self::with_registry(registry, config)
    }

    /// Creates a manager over an existing registry, which may be shared with
    /// other managers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is rejected or
    /// its `cluster_prefix` differs from the registry's prefix.
    pub fn with_registry(
        registry: Arc<ClusterRegistry<C>>,
        config: MailboxConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        if registry.prefix() != config.cluster_prefix {
            return Err(Error::InvalidConfig(format!(
                "cluster_prefix {:?} does not match registry prefix {:?}",
                config.cluster_prefix,
                registry.prefix()
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                config,
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MailboxConfig {
        &self.inner.config
    }

    /// Returns the cluster registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClusterRegistry<C>> {
        &self.inner.registry
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.inner.counters.snapshot()
    }

    /// Whether [`shutdown`](Self::shutdown) was called on this manager or a
    /// clone of it.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops this manager and its clones: later transactions fail with
    /// [`Error::Shutdown`]. Transactions already in flight run to completion.
    ///
    /// The registry is left alone; other managers sharing it keep working.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!(stats = ?self.stats(), "shutting down transaction manager");
        }
    }

    /// Runs `body` against a fresh context and commits what it staged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Body`] if the body fails or panics (nothing is
    /// submitted), [`Error::Cluster`] or [`Error::Consensus`] if the node's
    /// cluster cannot be reached, [`Error::Conflict`] if a guard the body set
    /// did not hold, and [`Error::Shutdown`] once the manager is shut down.
    pub async fn run_transaction<T, F>(&self, node: &NodeId, body: F) -> Result<Committed<T>, Error>
    where
        F: FnOnce(&mut dyn TransactionScope) -> Result<T, BodyError>,
    {
        self.ensure_open()?;
        let txn = Uuid::new_v4();
        Counters::bump(&self.inner.counters.started);

        let cluster = self.resolve(node).await?;

        let mut context = TransactionContext::new();
        let value = run_body(body, &mut context).map_err(|e| {
            Counters::bump(&self.inner.counters.aborted);
            debug!(%txn, %node, "transaction body failed: {e}");
            Error::Body(e)
        })?;

        let result = self.submit(&cluster, node, txn, context).await?;
        match result.status {
            ApplyStatus::Applied => {
                Counters::bump(&self.inner.counters.committed);
                Ok(Committed {
                    value,
                    reads: result.reads,
                })
            }
            ApplyStatus::Conflict { .. } => Err(Error::Conflict { attempts: 1 }),
        }
    }

    /// Folds every body, in order, over one shared context and commits the
    /// result as a single transaction.
    ///
    /// Every body runs even after one fails; if any failed nothing is
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bodies`] with every body failure, otherwise the same
    /// errors as [`run_transaction`](Self::run_transaction).
    pub async fn coordinate_transaction<T>(
        &self,
        node: &NodeId,
        bodies: Vec<TransactionBody<T>>,
    ) -> Result<Committed<Vec<T>>, Error> {
        self.ensure_open()?;
        let txn = Uuid::new_v4();
        Counters::bump(&self.inner.counters.started);

        let cluster = self.resolve(node).await?;

        let mut context = TransactionContext::new();
        let mut values = Vec::with_capacity(bodies.len());
        let mut errors = Vec::new();

        for body in bodies {
            match run_body(body, &mut context) {
                Ok(value) => values.push(value),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            Counters::bump(&self.inner.counters.aborted);
            debug!(%txn, %node, failed = errors.len(), "coordinated transaction aborted");
            return Err(Error::Bodies(errors));
        }

        let result = self.submit(&cluster, node, txn, context).await?;
        match result.status {
            ApplyStatus::Applied => {
                Counters::bump(&self.inner.counters.committed);
                Ok(Committed {
                    value: values,
                    reads: result.reads,
                })
            }
            ApplyStatus::Conflict { .. } => Err(Error::Conflict { attempts: 1 }),
        }
    }

    /// Runs [`run_transaction`](Self::run_transaction) in the background.
    /// The outcome is only logged.
    pub fn cast_transaction<T, F>(&self, node: NodeId, body: F)
    where
        F: FnOnce(&mut dyn TransactionScope) -> Result<T, BodyError> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.clone();

        tokio::spawn(async move {
            match manager.run_transaction(&node, body).await {
                Ok(_) => debug!(%node, "cast transaction committed"),
                Err(e) => warn!(%node, "cast transaction failed: {e}"),
            }
        });
    }

    /// Optimistic read-modify-write over `keys`.
    ///
    /// Reads `keys` through the log, hands the snapshot to `body`, then
    /// commits the staged writes guarded on every key still being at the
    /// version that was read. On conflict both steps are repeated. A body
    /// that stages no write commits nothing further.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] once the retry budget is spent, otherwise
    /// the same errors as [`run_transaction`](Self::run_transaction).
    pub async fn read_modify_write<T, F>(
        &self,
        node: &NodeId,
        keys: Vec<Key>,
        mut body: F,
    ) -> Result<T, Error>
    where
        F: FnMut(&ReadResults, &mut dyn TransactionScope) -> Result<T, BodyError>,
    {
        self.ensure_open()?;
        let txn = Uuid::new_v4();
        Counters::bump(&self.inner.counters.started);

        let cluster = self.resolve(node).await?;
        let timeout = self.inner.config.propose_timeout;
        let mut attempts = 0;

        loop {
            attempts += 1;

            let snapshot = protocol::submit(&cluster, keys.clone(), Vec::new(), timeout)
                .await
                .inspect_err(|e| self.record_failure(txn, node, e))?;

            let mut context = TransactionContext::new();
            for read in snapshot.iter() {
                context.expect_version(read.key.clone(), read.version());
            }

            let value = run_body(|scope| body(&snapshot, scope), &mut context).map_err(|e| {
                Counters::bump(&self.inner.counters.aborted);
                debug!(%txn, %node, "read-modify-write body failed: {e}");
                Error::Body(e)
            })?;

            if context.is_read_only() {
                Counters::bump(&self.inner.counters.committed);
                return Ok(value);
            }

            let result = self.submit(&cluster, node, txn, context).await?;
            match result.status {
                ApplyStatus::Applied => {
                    Counters::bump(&self.inner.counters.committed);
                    return Ok(value);
                }
                ApplyStatus::Conflict { key } => {
                    if attempts > self.inner.config.max_conflict_retries {
                        warn!(%txn, %node, attempts, "giving up after repeated conflicts");
                        return Err(Error::Conflict { attempts });
                    }
                    debug!(%txn, %node, %key, attempts, "conflict, retrying");
                }
            }
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    async fn resolve(&self, node: &NodeId) -> Result<C::Cluster, Error> {
        self.inner
            .registry
            .get_or_create(node)
            .await
            .inspect_err(|_| Counters::bump(&self.inner.counters.failed))
    }

    async fn submit(
        &self,
        cluster: &C::Cluster,
        node: &NodeId,
        txn: Uuid,
        context: TransactionContext,
    ) -> Result<ApplyResult, Error> {
        let transaction = context.into_transaction();
        let (reads, writes, guards) = (
            transaction.reads.len(),
            transaction.writes.len(),
            transaction.guards.len(),
        );

        let result = protocol::submit_guarded(cluster, transaction, self.inner.config.propose_timeout)
            .await
            .inspect_err(|e| self.record_failure(txn, node, e))?;

        match &result.status {
            ApplyStatus::Applied => {
                debug!(%txn, %node, reads, writes, guards, "transaction committed");
            }
            ApplyStatus::Conflict { key } => {
                Counters::bump(&self.inner.counters.conflicts);
                debug!(%txn, %node, %key, "transaction guard failed");
            }
        }

        Ok(result)
    }

    fn record_failure(&self, txn: Uuid, node: &NodeId, error: &Error) {
        Counters::bump(&self.inner.counters.failed);
        warn!(%txn, %node, "transaction failed: {error}");
    }
}

/// Runs a body, turning a panic into [`BodyError::Panicked`].
fn run_body<T, F>(body: F, context: &mut TransactionContext) -> Result<T, BodyError>
where
    F: FnOnce(&mut dyn TransactionScope) -> Result<T, BodyError>,
{
    panic::catch_unwind(AssertUnwindSafe(|| body(context)))
        .unwrap_or_else(|payload| Err(BodyError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
