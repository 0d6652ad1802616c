//! Embedded ordered KV store
//!
//! Writes are serialized through the WAL mutex, appended as one record per
//! batch, then applied to the memtable under its write lock. Readers take the
//! memtable read lock and the published sequence together, so a batch is
//! either fully visible or not at all.

use crate::cursor::KvCursor;
use crate::error::{KvError, Result};
use crate::memtable::MemTable;
use crate::options::StoreOptions;
use crate::persistence::checkpoint::CheckpointWriter;
use crate::persistence::format::WalOp;
use crate::persistence::handle::FlushHandle;
use crate::persistence::recovery::RecoveryManager;
use crate::persistence::wal::WalWriter;
use crate::persistence::{RecoveryStats, CURRENT_FILE};
use crate::snapshot::{SnapshotId, SnapshotTracker};
use crate::types::{BatchOp, Sequence};
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CURRENT_CONTENTS: &str = "ouroboros-level 1\n";

/// Locations open in this process
static OPEN_LOCATIONS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a store directory, released on drop
#[derive(Debug)]
struct LocationLock {
    path: PathBuf,
}

impl LocationLock {
    fn acquire(path: &Path) -> Result<Self> {
        let mut open = OPEN_LOCATIONS.lock();
        if !open.insert(path.to_path_buf()) {
            return Err(KvError::Io(format!("{}: lock held by another handle", path.display())));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        OPEN_LOCATIONS.lock().remove(&self.path);
    }
}

/// Shared store state; cursors hold their own reference
pub(crate) struct StoreInner {
    location: PathBuf,
    options: StoreOptions,
    pub(crate) table: RwLock<MemTable>,
    pub(crate) last_sequence: AtomicU64,
    pub(crate) snapshots: SnapshotTracker,
    wal: Arc<Mutex<WalWriter>>,
    flusher: Mutex<Option<FlushHandle>>,
    checkpoints: CheckpointWriter,
    closed: AtomicBool,
    lock: Mutex<Option<LocationLock>>,
    recovery: RecoveryStats,
}

impl StoreInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(KvError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cut a checkpoint and reset the WAL; the caller holds the WAL mutex
    fn checkpoint_locked(&self, wal: &mut WalWriter) -> Result<()> {
        let (sequence, entries) = {
            let table = self.table.read();
            let sequence = self.last_sequence.load(Ordering::Acquire);
            (sequence, table.live_entries(sequence))
        };
        self.checkpoints.write(&self.location, sequence, entries)?;
        wal.reset()?;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.shutdown()?;
        }

        let mut wal = self.wal.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if wal.record_bytes() > 0 {
            self.checkpoint_locked(&mut wal)?;
        }
        wal.flush()?;
        drop(wal);

        self.snapshots.clear();
        self.lock.lock().take();
        info!("Closed store at {}", self.location.display());
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!("Store at {} dropped without close", self.location.display());
            if let Err(e) = self.shutdown() {
                error!("Failed to close store on drop: {}", e);
            }
        }
    }
}

/// Ordered, crash-safe key-value store rooted at a directory
pub struct KvStore {
    inner: Arc<StoreInner>,
}

impl KvStore {
    /// Open (or create) the store at `location`
    pub fn open(location: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let location = location.as_ref();
        options.validate()?;

        let created = prepare_directory(location, &options)?;
        let location = fs::canonicalize(location)?;
        let lock = LocationLock::acquire(&location)?;

        if created {
            fs::write(location.join(CURRENT_FILE), CURRENT_CONTENTS)?;
            info!("Created store at {}", location.display());
        }

        let recovered = RecoveryManager::recover(&location)?;
        let last_sequence = recovered.last_sequence;
        let table = MemTable::from_image(recovered.image, last_sequence);

        let flush_interval = Duration::from_millis(options.flush_interval_ms);
        let wal = Arc::new(Mutex::new(WalWriter::open(&location, flush_interval)?));
        let flusher = FlushHandle::spawn(wal.clone(), flush_interval)?;
        let checkpoints = CheckpointWriter::new(options.compression, options.block_size, options.keep_checkpoints);

        info!(
            "Opened store at {} (sequence {}, {} keys)",
            location.display(),
            last_sequence,
            table.live_count(last_sequence)
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                location,
                options,
                table: RwLock::new(table),
                last_sequence: AtomicU64::new(last_sequence),
                snapshots: SnapshotTracker::new(),
                wal,
                flusher: Mutex::new(Some(flusher)),
                checkpoints,
                closed: AtomicBool::new(false),
                lock: Mutex::new(Some(lock)),
                recovery: recovered.stats,
            }),
        })
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Statistics from the recovery performed at open
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.inner.recovery
    }

    /// Highest committed sequence
    pub fn last_sequence(&self) -> Sequence {
        self.inner.last_sequence.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &[u8], snapshot: Option<SnapshotId>) -> Result<Option<Bytes>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let table = inner.table.read();
        let sequence = match snapshot {
            Some(id) => inner.snapshots.resolve(id)?,
            None => inner.last_sequence.load(Ordering::Acquire),
        };
        Ok(table.get(key, sequence).cloned())
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>, sync: bool) -> Result<()> {
        self.write(&[BatchOp::put(key, value)], sync)
    }

    pub fn delete(&self, key: impl Into<Bytes>, sync: bool) -> Result<()> {
        self.write(&[BatchOp::delete(key)], sync)
    }

    /// Apply `ops` atomically
    pub fn write(&self, ops: &[BatchOp], sync: bool) -> Result<()> {
        if ops.is_empty() {
            return self.inner.ensure_open();
        }

        let inner = &self.inner;
        let mut wal = inner.wal.lock();
        inner.ensure_open()?;

        let first = inner.last_sequence.load(Ordering::Acquire) + 1;
        let last = first + ops.len() as Sequence - 1;

        wal.append(WalOp::from_ops(first, ops))?;
        if sync {
            wal.flush()?;
        }

        {
            let mut table = inner.table.write();
            for (offset, op) in ops.iter().enumerate() {
                table.apply(op, first + offset as Sequence);
            }
            inner.last_sequence.store(last, Ordering::Release);

            let floor = inner.snapshots.min_pinned(last);
            table.prune(ops.iter().map(BatchOp::key), floor);
        }

        debug!("Committed {} op(s) at sequence {}..={}", ops.len(), first, last);

        if wal.record_bytes() > inner.options.write_buffer_size as u64 {
            info!(
                "WAL at {} bytes exceeds write buffer, cutting checkpoint",
                wal.record_bytes()
            );
            // The batch is already committed; a failed checkpoint keeps the WAL
            if let Err(e) = inner.checkpoint_locked(&mut wal) {
                warn!("Checkpoint after write failed, keeping WAL: {}", e);
            }
        }

        Ok(())
    }

    /// Pin the current state for consistent reads
    pub fn snapshot(&self) -> Result<SnapshotId> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let _table = inner.table.read();
        let sequence = inner.last_sequence.load(Ordering::Acquire);
        Ok(inner.snapshots.pin(sequence))
    }

    pub fn release_snapshot(&self, id: SnapshotId) -> Result<()> {
        self.inner.snapshots.release(id)
    }

    /// Cursor over the store as of `snapshot`, or a fresh implicit snapshot
    pub fn cursor(&self, snapshot: Option<SnapshotId>) -> Result<KvCursor> {
        let inner = &self.inner;
        inner.ensure_open()?;
        match snapshot {
            Some(id) => {
                let sequence = inner.snapshots.resolve(id)?;
                Ok(KvCursor::new(inner.clone(), sequence, None))
            }
            None => {
                let id = self.snapshot()?;
                let sequence = inner.snapshots.resolve(id)?;
                Ok(KvCursor::new(inner.clone(), sequence, Some(id)))
            }
        }
    }

    /// Approximate bytes stored for keys in `[start, end)`
    pub fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64> {
        self.inner.ensure_open()?;
        if start > end {
            return Err(KvError::InvalidArgument(
                "approximate_size: start is after end".to_string(),
            ));
        }
        Ok(self.inner.table.read().approximate_size(start, end))
    }

    /// Diagnostic property, `None` for unknown names
    pub fn property(&self, name: &str) -> Option<String> {
        let inner = &self.inner;
        if inner.is_closed() {
            return None;
        }
        let sequence = inner.last_sequence.load(Ordering::Acquire);

        match name {
            "ouroboros.num-entries" => Some(inner.table.read().live_count(sequence).to_string()),
            "ouroboros.approximate-memory-usage" => {
                Some(inner.table.read().memory_usage().to_string())
            }
            "ouroboros.wal-bytes" => Some(inner.wal.lock().record_bytes().to_string()),
            "ouroboros.sequence" => Some(sequence.to_string()),
            "ouroboros.snapshots" => Some(inner.snapshots.len().to_string()),
            "ouroboros.options" => serde_json::to_string(&inner.options).ok(),
            "ouroboros.stats" => Some(self.stats_summary(sequence)),
            _ => None,
        }
    }

    fn stats_summary(&self, sequence: Sequence) -> String {
        let inner = &self.inner;
        let (live, versions, memory) = {
            let table = inner.table.read();
            (table.live_count(sequence), table.version_count(), table.memory_usage())
        };
        let wal_bytes = inner.wal.lock().record_bytes();

        format!(
            "location: {}\nsequence: {}\nlive entries: {}\nretained versions: {}\nmemory bytes: {}\nwal bytes: {}\nsnapshots: {}\nrecovered records: {}\n",
            inner.location.display(),
            sequence,
            live,
            versions,
            memory,
            wal_bytes,
            inner.snapshots.len(),
            inner.recovery.wal_records_replayed,
        )
    }

    /// Flush, checkpoint and release the location
    pub fn close(&self) -> Result<()> {
        self.inner.shutdown()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Apply directory options; returns true when a new store was created
fn prepare_directory(location: &Path, options: &StoreOptions) -> Result<bool> {
    let marker = location.join(CURRENT_FILE);

    if marker.is_file() {
        if options.error_if_exists {
            return Err(KvError::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                location.display()
            )));
        }
        return Ok(false);
    }

    if !options.create_if_missing {
        return Err(KvError::InvalidArgument(format!(
            "{}: does not exist (create_if_missing is false)",
            location.display()
        )));
    }

    if location.exists() && !location.is_dir() {
        return Err(KvError::Io(format!("{}: not a directory", location.display())));
    }

    fs::create_dir_all(location)?;
    Ok(true)
}
