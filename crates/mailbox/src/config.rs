//! Transaction manager and mailbox configuration.

use std::time::Duration;

use courier_consensus::is_safe_char;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Longest accepted cluster name prefix.
pub const MAX_PREFIX_LEN: usize = 32;

/// Configuration for the transaction manager and mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Upper bound for a single proposal.
    pub propose_timeout: Duration,

    /// Retries of an optimistic read-modify-write after a conflict.
    pub max_conflict_retries: u32,

    /// Prefix of every derived cluster name.
    pub cluster_prefix: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            propose_timeout: Duration::from_secs(5),
            max_conflict_retries: 16,
            cluster_prefix: "mailbox".to_string(),
        }
    }
}

impl MailboxConfig {
    /// Sets the proposal timeout.
    #[must_use]
    pub const fn with_propose_timeout(mut self, timeout: Duration) -> Self {
        self.propose_timeout = timeout;
        self
    }

    /// Sets the conflict retry budget.
    #[must_use]
    pub const fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Sets the cluster name prefix.
    #[must_use]
    pub fn with_cluster_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cluster_prefix = prefix.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.propose_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "propose_timeout must be non-zero".to_string(),
            ));
        }

        if self.cluster_prefix.is_empty() || self.cluster_prefix.len() > MAX_PREFIX_LEN {
            return Err(Error::InvalidConfig(format!(
                "cluster_prefix must be 1..={MAX_PREFIX_LEN} characters"
            )));
        }

        if let Some(c) = self.cluster_prefix.chars().find(|c| !is_safe_char(*c)) {
            return Err(Error::InvalidConfig(format!(
                "cluster_prefix contains invalid character {c:?}"
            )));
        }

        Ok(())
    }
}
