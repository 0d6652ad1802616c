//! Embedded ordered key-value store for ouroboros-level
//!
//! # Features
//! - Byte-ordered keys with multi-version reads (snapshots)
//! - Atomic batches, one WAL record per batch
//! - Crash recovery from checkpoint + WAL replay
//! - Lock-free cursors that re-seek per step

pub mod cursor;
pub mod engine;
pub mod error;
pub mod memtable;
pub mod options;
pub mod persistence;
pub mod snapshot;
pub mod types;

pub use cursor::KvCursor;
pub use engine::KvStore;
pub use error::{KvError, Result};
pub use options::{Compression, StoreOptions};
pub use snapshot::SnapshotId;
pub use types::{BatchOp, Sequence};
