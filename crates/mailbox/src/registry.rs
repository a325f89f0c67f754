//! Lazily created, per-node clusters.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use courier_consensus::{ClusterName, Consensus, MAX_CLUSTER_NAME_LEN, is_safe_char};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::Error;
use crate::state_machine::MailboxStateMachine;
use crate::types::NodeId;

/// Bytes of the SHA-256 digest appended to every name.
const DIGEST_BYTES: usize = 8;

/// Derives the cluster name of a node.
///
/// Names read `<prefix>_<id>_<digest>`: characters outside `[A-Za-z0-9_-]`
/// become `_`, the id part is truncated to fit, and the digest of the raw id
/// keeps distinct ids on distinct names.
///
/// # Errors
///
/// Returns [`Error::Cluster`] if no valid name can be formed from `prefix`.
pub fn cluster_name(prefix: &str, node: &NodeId) -> Result<ClusterName, Error> {
    let mut sanitized: String = node
        .as_str()
        .chars()
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .collect();

    let digest = hex::encode(&Sha256::digest(node.as_str().as_bytes())[..DIGEST_BYTES]);
    let room = MAX_CLUSTER_NAME_LEN.saturating_sub(prefix.len() + digest.len() + 2);
    // Sanitized ids are ASCII, so truncating on a byte index is safe.
    sanitized.truncate(room);
    let name = format!("{prefix}_{sanitized}_{digest}");

    ClusterName::new(name).map_err(|e| Error::Cluster {
        node: node.clone(),
        reason: e.to_string(),
    })
}

/// Maps node ids to their dedicated clusters, creating each on first use.
pub struct ClusterRegistry<C>
where
    C: Consensus<MailboxStateMachine>,
{
    consensus: C,
    prefix: String,
    clusters: DashMap<NodeId, Arc<OnceCell<C::Cluster>>>,
}

impl<C> Debug for ClusterRegistry<C>
where
    C: Consensus<MailboxStateMachine>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("prefix", &self.prefix)
            .field("clusters", &self.len())
            .finish_non_exhaustive()
    }
}

impl<C> ClusterRegistry<C>
where
    C: Consensus<MailboxStateMachine>,
{
    /// Creates an empty registry.
    pub fn new(consensus: C, prefix: impl Into<String>) -> Self {
        Self {
            consensus,
            prefix: prefix.into(),
            clusters: DashMap::new(),
        }
    }

    /// Prefix of every cluster name this registry derives.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the cluster of `node`, creating it on first use.
    ///
    /// Concurrent first calls for the same node create a single cluster. A
    /// failed creation is not cached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cluster`] if the substrate cannot create the cluster.
    pub async fn get_or_create(&self, node: &NodeId) -> Result<C::Cluster, Error> {
        // Clone the cell out so no map shard lock is held across the await.
        let cell = Arc::clone(&self.clusters.entry(node.clone()).or_default());

        let result = cell
            .get_or_try_init(|| async {
                let name = cluster_name(&self.prefix, node)?;

                let cluster = self
                    .consensus
                    .create_cluster(name.clone(), MailboxStateMachine)
                    .await
                    .map_err(|e| Error::Cluster {
                        node: node.clone(),
                        reason: e.to_string(),
                    })?;

                info!(%node, cluster = %name, "created node cluster");
                Ok::<_, Error>(cluster)
            })
            .await;

        match result {
            Ok(cluster) => Ok(cluster.clone()),
            Err(e) => {
                // The cell stays empty; the next call retries creation.
                warn!(%node, "cluster creation failed: {e}");
                Err(e)
            }
        }
    }

    /// Whether a cluster exists for `node`.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.clusters
            .get(node)
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of clusters created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clusters
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Whether no cluster has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every node with a cluster.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.clusters
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drops every cached handle.
    ///
    /// Only the registry's owner should call this, once no manager uses it:
    /// the substrate refuses to create a cluster under a name it already
    /// issued, so cleared nodes cannot be reached again.
    pub fn clear(&self) {
        debug!(clusters = self.len(), "clearing cluster registry");
        self.clusters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_id_kept_readable() {
        let name = cluster_name("mailbox", &NodeId::from("node-1")).unwrap();
        assert!(name.as_str().starts_with("mailbox_node-1_"));
        assert_eq!(name.as_str().len(), "mailbox_node-1_".len() + 2 * DIGEST_BYTES);
    }

    #[test]
    fn test_rewritten_ids_stay_distinct() {
        let dotted = cluster_name("mailbox", &NodeId::from("a.b")).unwrap();
        let slashed = cluster_name("mailbox", &NodeId::from("a/b")).unwrap();
        let underscored = cluster_name("mailbox", &NodeId::from("a_b")).unwrap();

        assert!(dotted.as_str().starts_with("mailbox_a_b_"));
        assert!(underscored.as_str().starts_with("mailbox_a_b_"));
        assert_ne!(dotted, slashed);
        assert_ne!(dotted, underscored);
    }

    #[test]
    fn test_id_spelling_another_name_gets_its_own() {
        let dotted = cluster_name("mailbox", &NodeId::from("a.b")).unwrap();
        // A plain id equal to the dotted id's name minus the prefix.
        let lookalike = NodeId::new(dotted.as_str().trim_start_matches("mailbox_"));

        assert_ne!(cluster_name("mailbox", &lookalike).unwrap(), dotted);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let node = NodeId::from("node@example.com");
        assert_eq!(
            cluster_name("mailbox", &node).unwrap(),
            cluster_name("mailbox", &node).unwrap()
        );
    }

    #[test]
    fn test_long_id_truncated() {
        let long = NodeId::new("n".repeat(500));
        let name = cluster_name("mailbox", &long).unwrap();
        assert_eq!(name.as_str().len(), MAX_CLUSTER_NAME_LEN);

        let other = NodeId::new(format!("{}m", "n".repeat(499)));
        assert_ne!(cluster_name("mailbox", &other).unwrap(), name);
    }

    #[test]
    fn test_empty_id() {
        let name = cluster_name("mailbox", &NodeId::from("")).unwrap();
        assert!(name.as_str().starts_with("mailbox__"));
    }
}
