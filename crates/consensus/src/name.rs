use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted cluster name.
pub const MAX_CLUSTER_NAME_LEN: usize = 128;

/// Rejected cluster name.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidClusterName {
    /// The name is empty.
    #[error("cluster name is empty")]
    Empty,

    /// The name is longer than [`MAX_CLUSTER_NAME_LEN`].
    #[error("cluster name is {0} bytes long (max {MAX_CLUSTER_NAME_LEN})")]
    TooLong(usize),

    /// The name contains a character outside `[A-Za-z0-9_-]`.
    #[error("cluster name contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Validated cluster name: 1 to [`MAX_CLUSTER_NAME_LEN`] characters from
/// `[A-Za-z0-9_-]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterName(String);

impl ClusterName {
    /// Validates and wraps a name.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidClusterName`] if the name is empty, too long, or
    /// contains a character outside the safe alphabet.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidClusterName> {
        let name = name.into();

        if name.is_empty() {
            return Err(InvalidClusterName::Empty);
        }

        if name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(InvalidClusterName::TooLong(name.len()));
        }

        if let Some(c) = name.chars().find(|c| !is_safe_char(*c)) {
            return Err(InvalidClusterName::InvalidCharacter(c));
        }

        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether `c` belongs to the cluster name alphabet.
#[must_use]
pub const fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Display for ClusterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClusterName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClusterName {
    type Error = InvalidClusterName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClusterName> for String {
    fn from(name: ClusterName) -> Self {
        name.0
    }
}
