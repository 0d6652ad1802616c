//! KV store error types

use crate::persistence::PersistenceError;
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors reported by the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Store is closed")]
    Closed,
}

impl From<PersistenceError> for KvError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Io(e) => KvError::Io(e.to_string()),
            PersistenceError::DataDirectory(msg) => KvError::Io(msg),
            PersistenceError::RecordTooLarge { .. } => KvError::InvalidArgument(err.to_string()),
            PersistenceError::UnsupportedCodec(_) | PersistenceError::UnsupportedVersion(_) => {
                KvError::NotSupported(err.to_string())
            }
            other => KvError::Corruption(other.to_string()),
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io(err.to_string())
    }
}
