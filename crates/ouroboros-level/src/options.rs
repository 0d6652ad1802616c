//! Operation options

use crate::error::{LevelError, Result};
use crate::snapshot::SnapshotId;
use bytes::Bytes;
use ouroboros_level_kv::{Compression, StoreOptions};
use serde::{Deserialize, Serialize};

/// Options for opening a database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Create the database if it does not exist (default: true)
    pub create_if_missing: bool,

    /// Fail if the database already exists (default: false)
    pub error_if_exists: bool,

    /// Compress on-disk blocks (default: true)
    pub compression: bool,

    /// Block cache size in bytes (default: 8MB); accepted as a hint, the
    /// engine keeps no block cache
    pub cache_size: usize,

    /// Bytes buffered before being persisted to a table (default: 4MB)
    pub write_buffer_size: usize,

    /// Block size in bytes (default: 4KB)
    pub block_size: usize,

    /// Maximum open files (default: 1000); accepted as a hint
    pub max_open_files: usize,

    /// Keys between restart points (default: 16); accepted as a hint
    pub block_restart_interval: usize,

    /// Bloom filter bits per key, 0 disables (default: 0); accepted as a hint
    pub bloom_filter_bits: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            compression: true,
            cache_size: 8 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
            block_size: 4096,
            max_open_files: 1000,
            block_restart_interval: 16,
            bloom_filter_bits: 0,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| LevelError::InvalidArgument(format!("invalid options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn with_error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    pub fn with_compression(mut self, value: bool) -> Self {
        self.compression = value;
        self
    }

    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.store_options().validate().map_err(LevelError::from)
    }

    /// Engine configuration for these options
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            create_if_missing: self.create_if_missing,
            error_if_exists: self.error_if_exists,
            compression: if self.compression {
                Compression::Deflate
            } else {
                Compression::None
            },
            cache_size: self.cache_size,
            write_buffer_size: self.write_buffer_size,
            block_size: self.block_size,
            max_open_files: self.max_open_files,
            block_restart_interval: self.block_restart_interval,
            bloom_filter_bits: self.bloom_filter_bits,
            ..StoreOptions::default()
        }
    }
}

/// Options for writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Fsync before acknowledging
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// Options for point reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub fill_cache: bool,

    /// Return raw bytes instead of text
    pub as_buffer: bool,

    /// Read as of this snapshot instead of the latest state
    pub snapshot: Option<SnapshotId>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            fill_cache: true,
            as_buffer: true,
            snapshot: None,
        }
    }
}

impl ReadOptions {
    pub fn as_text() -> Self {
        Self {
            as_buffer: false,
            ..Self::default()
        }
    }

    pub fn at(snapshot: SnapshotId) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::default()
        }
    }
}

/// Options for range iteration
///
/// When both an inclusive and an exclusive bound are given for the same
/// side, the exclusive one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorOptions {
    pub reverse: bool,
    pub gte: Option<Bytes>,
    pub gt: Option<Bytes>,
    pub lte: Option<Bytes>,
    pub lt: Option<Bytes>,

    /// Maximum entries to yield; negative means unlimited
    pub limit: i64,

    pub fill_cache: bool,
    pub key_as_buffer: bool,
    pub value_as_buffer: bool,

    /// Iterate this snapshot; `None` takes a fresh implicit one
    pub snapshot: Option<SnapshotId>,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            reverse: false,
            gte: None,
            gt: None,
            lte: None,
            lt: None,
            limit: -1,
            fill_cache: false,
            key_as_buffer: true,
            value_as_buffer: true,
            snapshot: None,
        }
    }
}

impl IteratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn gte(mut self, key: impl Into<Bytes>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn gt(mut self, key: impl Into<Bytes>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<Bytes>) -> Self {
        self.lte = Some(key.into());
        self
    }

    pub fn lt(mut self, key: impl Into<Bytes>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn as_text(mut self) -> Self {
        self.key_as_buffer = false;
        self.value_as_buffer = false;
        self
    }

    pub fn snapshot(mut self, snapshot: SnapshotId) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}
