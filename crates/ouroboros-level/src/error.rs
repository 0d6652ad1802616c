//! Error types and status codes

use ouroboros_level_kv::KvError;
use thiserror::Error;

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, LevelError>;

/// Status code reported for every completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Corruption = 2,
    NotSupported = 3,
    InvalidArgument = 4,
    IOError = 5,
    NotOpened = 6,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Status of a finished operation
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

/// Errors reported by the database
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LevelError {
    #[error("Database is not open")]
    NotOpened,

    #[error("NotFound")]
    NotFound,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl LevelError {
    pub fn status(&self) -> Status {
        match self {
            LevelError::NotOpened => Status::NotOpened,
            LevelError::NotFound => Status::NotFound,
            LevelError::InvalidArgument(_) => Status::InvalidArgument,
            LevelError::Io(_) => Status::IOError,
            LevelError::Corruption(_) => Status::Corruption,
            LevelError::NotSupported(_) => Status::NotSupported,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LevelError::NotFound)
    }
}

impl From<KvError> for LevelError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Io(msg) => LevelError::Io(msg),
            KvError::Corruption(msg) => LevelError::Corruption(msg),
            KvError::InvalidArgument(msg) => LevelError::InvalidArgument(msg),
            KvError::NotSupported(msg) => LevelError::NotSupported(msg),
            KvError::Closed => LevelError::Io("store is closed".to_string()),
        }
    }
}
