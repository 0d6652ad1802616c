//! KV store data types
//!
//! Keys and values are opaque byte strings ordered lexicographically.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Monotonic write sequence number; every applied mutation gets a fresh one.
pub type Sequence = u64;

/// A single mutation inside an atomic write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Insert or overwrite a key
    Put { key: Bytes, value: Bytes },
    /// Remove a key (no-op if absent)
    Delete { key: Bytes },
}

impl BatchOp {
    /// Create a put operation
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a delete operation
    pub fn delete(key: impl Into<Bytes>) -> Self {
        BatchOp::Delete { key: key.into() }
    }

    /// The key this operation touches
    pub fn key(&self) -> &Bytes {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    /// Bytes this operation adds to the store
    pub fn encoded_len(&self) -> usize {
        match self {
            BatchOp::Put { key, value } => key.len() + value.len(),
            BatchOp::Delete { key } => key.len(),
        }
    }
}

/// One version of a key; `None` marks a deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub sequence: Sequence,
    pub value: Option<Bytes>,
}

impl Version {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Bytes charged against the store for this version (key excluded)
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}
