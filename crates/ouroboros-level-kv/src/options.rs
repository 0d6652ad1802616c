//! Store configuration

use crate::error::{KvError, Result};
use serde::{Deserialize, Serialize};

/// Block codec used for checkpoint files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Store blocks as-is
    None,
    /// Deflate each checkpoint block
    Deflate,
}

impl Compression {
    /// On-disk codec tag
    pub fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Deflate),
            _ => None,
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Deflate
    }
}

/// Options for opening a store
///
/// `cache_size`, `max_open_files`, `block_restart_interval` and
/// `bloom_filter_bits` are tuning hints for table-based engines. The store
/// keeps its whole live set in memory, so it validates and reports them
/// (see the `ouroboros.options` property) without acting on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Create the store directory when it does not exist (default: true)
    pub create_if_missing: bool,

    /// Fail when the store already exists (default: false)
    pub error_if_exists: bool,

    /// Checkpoint block codec (default: deflate)
    pub compression: Compression,

    /// Block cache capacity in bytes (default: 8MB)
    pub cache_size: usize,

    /// WAL bytes accumulated before a checkpoint is cut (default: 4MB)
    pub write_buffer_size: usize,

    /// Target size of a checkpoint block before compression (default: 4KB)
    pub block_size: usize,

    /// Maximum open file handles (default: 1000)
    pub max_open_files: usize,

    /// Keys between restart points in a block (default: 16)
    pub block_restart_interval: usize,

    /// Bloom filter bits per key, 0 disables the filter (default: 0)
    pub bloom_filter_bits: u32,

    /// Background WAL fsync interval in milliseconds (default: 100ms)
    pub flush_interval_ms: u64,

    /// Number of checkpoint files kept on disk (default: 2)
    pub keep_checkpoints: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            compression: Compression::Deflate,
            cache_size: 8 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
            block_size: 4096,
            max_open_files: 1000,
            block_restart_interval: 16,
            bloom_filter_bits: 0,
            flush_interval_ms: 100,
            keep_checkpoints: 2,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn with_error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
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

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    /// Reject settings the store cannot honor
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("cache_size", self.cache_size),
            ("write_buffer_size", self.write_buffer_size),
            ("block_size", self.block_size),
            ("max_open_files", self.max_open_files),
            ("block_restart_interval", self.block_restart_interval),
            ("keep_checkpoints", self.keep_checkpoints),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(KvError::InvalidArgument(format!("{} must be greater than 0", name)));
            }
        }
        if self.bloom_filter_bits > 64 {
            return Err(KvError::InvalidArgument(format!(
                "bloom_filter_bits must be at most 64, got {}",
                self.bloom_filter_bits
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(KvError::InvalidArgument("flush_interval_ms must be greater than 0".to_string()));
        }
        Ok(())
    }
}
