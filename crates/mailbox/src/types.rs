//! Identifiers and the key/value vocabulary of the state machine.

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(NodeId, "Opaque identifier of a node; every node gets its own cluster.");
string_id!(UserId, "Opaque identifier of a mailbox owner.");
string_id!(Key, "Key in the replicated key/value state.");

/// A stored value with the state revision that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    /// Stored bytes.
    pub value: Bytes,

    /// Revision of the command that last set this key.
    pub version: u64,
}

/// One staged write.
///
/// Kinds this build does not know about decode as [`WriteOp::Unknown`] and
/// are skipped at apply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    /// Insert or overwrite a key.
    Set {
        /// Target key.
        key: Key,
        /// New value.
        value: Bytes,
    },

    /// Remove a key. Removing an absent key is a no-op.
    Delete {
        /// Target key.
        key: Key,
    },

    /// A write kind not understood by this build.
    #[serde(other)]
    Unknown,
}

/// Precondition checked against the pre-write state of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    /// Holds when the key's version equals `expected` (`None`: key absent).
    Version {
        /// Guarded key.
        key: Key,
        /// Expected version.
        expected: Option<u64>,
    },
}

impl Guard {
    /// The key this guard inspects.
    #[must_use]
    pub const fn key(&self) -> &Key {
        match self {
            Self::Version { key, .. } => key,
        }
    }
}

/// Value observed for one requested read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResult {
    /// Requested key.
    pub key: Key,

    /// Value before the command's writes, if the key existed.
    pub value: Option<Versioned>,
}

impl ReadResult {
    /// Version observed, `None` if the key was absent.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.value.as_ref().map(|v| v.version)
    }
}

/// Read results of a committed command, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResults(Vec<ReadResult>);

impl ReadResults {
    pub(crate) const fn new(results: Vec<ReadResult>) -> Self {
        Self(results)
    }

    /// First result recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&ReadResult> {
        self.0.iter().find(|r| &r.key == key)
    }

    /// Value observed for `key`, `None` if absent or not read.
    #[must_use]
    pub fn value(&self, key: &Key) -> Option<&Bytes> {
        self.get(key)
            .and_then(|r| r.value.as_ref())
            .map(|v| &v.value)
    }

    /// Iterates over results in request order.
    pub fn iter(&self) -> impl Iterator<Item = &ReadResult> {
        self.0.iter()
    }

    /// Number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no read was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
