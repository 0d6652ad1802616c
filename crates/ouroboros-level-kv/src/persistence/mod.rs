///! Persistence layer for the KV store
///!
///! Provides crash-safe durability using a Write-Ahead Log (WAL) with periodic checkpoints.
///!
///! ## Architecture
///!
///! - **WAL**: Append-only log recording every committed write (one record per batch)
///! - **Checkpoints**: Full image of the live key set, cut when the WAL grows past
///!   `write_buffer_size` and again on close
///! - **Batched Fsync**: background flusher thread; `sync` writes fsync inline
///! - **Recovery**: Load newest checkpoint + replay WAL records past its sequence
///!
///! ## Durability Guarantee
///!
///! Writes reach the WAL before they are acknowledged. Unsynced writes may lose up to
///! one flush interval on a machine crash; `sync` writes lose nothing.

pub mod checkpoint;
pub mod format;
pub mod handle;
pub mod recovery;
pub mod wal;

use std::time::Duration;
use thiserror::Error;

/// Marker file identifying a store directory
pub const CURRENT_FILE: &str = "CURRENT";

/// Name of the active WAL file
pub const WAL_FILE: &str = "wal-current.log";

/// Recovery statistics
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    /// Whether a checkpoint was loaded
    pub checkpoint_loaded: bool,

    /// Number of entries loaded from the checkpoint
    pub checkpoint_entries: usize,

    /// Number of WAL records replayed
    pub wal_records_replayed: usize,

    /// Number of corrupted or torn records skipped
    pub corrupted_records: usize,

    /// Highest sequence seen after recovery
    pub last_sequence: u64,

    /// Total recovery duration
    pub recovery_duration: Duration,
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted WAL entry at position {pos}: {reason}")]
    CorruptedWal { pos: u64, reason: String },

    #[error("Corrupted checkpoint: {0}")]
    CorruptedCheckpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Checksum mismatch at position {pos}: expected {expected:x}, got {actual:x}")]
    ChecksumMismatch {
        pos: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported compression codec: {0}")]
    UnsupportedCodec(u8),

    #[error("Invalid magic number: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: Vec<u8>, actual: Vec<u8> },

    #[error("Data directory error: {0}")]
    DataDirectory(String),

    #[error("Record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Nanoseconds since the Unix epoch (0 if the clock is before it)
pub(crate) fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
