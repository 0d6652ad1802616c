//! Storage engine contract
//!
//! The database drives any engine through these blocking calls; they are
//! only ever invoked from dispatcher workers, `_sync` callers and close.

use crate::error::Result;
use crate::options::OpenOptions;
use bytes::Bytes;
use ouroboros_level_kv::{BatchOp, KvCursor, KvStore, SnapshotId as KvSnapshotId};
use std::path::Path;

/// Engine-side point-in-time view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineSnapshot(pub u64);

/// Positionable cursor over an engine view
pub trait Cursor: Send {
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Position at the first key `>= target`
    fn seek(&mut self, target: &[u8]);
    /// Position at the last key `<= target`
    fn seek_for_prev(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn valid(&self) -> bool;
    fn key(&self) -> Option<Bytes>;
    fn value(&self) -> Option<Bytes>;
    fn status(&self) -> Result<()>;
}

/// Blocking, thread-safe ordered key-value engine
pub trait Engine: Send + Sync + Sized + 'static {
    fn open(path: &Path, options: &OpenOptions) -> Result<Self>;

    fn get(&self, key: &[u8], snapshot: Option<EngineSnapshot>) -> Result<Option<Bytes>>;

    /// Apply `ops` atomically
    fn write_batch(&self, ops: &[BatchOp], sync: bool) -> Result<()>;

    fn put(&self, key: Bytes, value: Bytes, sync: bool) -> Result<()> {
        self.write_batch(&[BatchOp::Put { key, value }], sync)
    }

    fn delete(&self, key: Bytes, sync: bool) -> Result<()> {
        self.write_batch(&[BatchOp::Delete { key }], sync)
    }

    fn new_cursor(&self, snapshot: Option<EngineSnapshot>) -> Result<Box<dyn Cursor>>;

    fn new_snapshot(&self) -> Result<EngineSnapshot>;

    fn release_snapshot(&self, snapshot: EngineSnapshot) -> Result<()>;

    /// Approximate bytes for keys in `[start, end)`
    fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64>;

    /// Diagnostic property, `None` for unknown names
    fn property(&self, name: &str) -> Option<String>;

    fn close(&self) -> Result<()>;
}

impl Cursor for KvCursor {
    fn seek_to_first(&mut self) {
        KvCursor::seek_to_first(self)
    }

    fn seek_to_last(&mut self) {
        KvCursor::seek_to_last(self)
    }

    fn seek(&mut self, target: &[u8]) {
        KvCursor::seek(self, target)
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        KvCursor::seek_for_prev(self, target)
    }

    fn next(&mut self) {
        KvCursor::next(self)
    }

    fn prev(&mut self) {
        KvCursor::prev(self)
    }

    fn valid(&self) -> bool {
        KvCursor::valid(self)
    }

    fn key(&self) -> Option<Bytes> {
        KvCursor::key(self).cloned()
    }

    fn value(&self) -> Option<Bytes> {
        KvCursor::value(self).cloned()
    }

    fn status(&self) -> Result<()> {
        KvCursor::status(self).map_err(Into::into)
    }
}

impl Engine for KvStore {
    fn open(path: &Path, options: &OpenOptions) -> Result<Self> {
        Ok(KvStore::open(path, options.store_options())?)
    }

    fn get(&self, key: &[u8], snapshot: Option<EngineSnapshot>) -> Result<Option<Bytes>> {
        Ok(KvStore::get(self, key, snapshot.map(|s| KvSnapshotId(s.0)))?)
    }

    fn write_batch(&self, ops: &[BatchOp], sync: bool) -> Result<()> {
        Ok(KvStore::write(self, ops, sync)?)
    }

    fn new_cursor(&self, snapshot: Option<EngineSnapshot>) -> Result<Box<dyn Cursor>> {
        let cursor = KvStore::cursor(self, snapshot.map(|s| KvSnapshotId(s.0)))?;
        Ok(Box::new(cursor))
    }

    fn new_snapshot(&self) -> Result<EngineSnapshot> {
        Ok(EngineSnapshot(KvStore::snapshot(self)?.0))
    }

    fn release_snapshot(&self, snapshot: EngineSnapshot) -> Result<()> {
        Ok(KvStore::release_snapshot(self, KvSnapshotId(snapshot.0))?)
    }

    fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64> {
        Ok(KvStore::approximate_size(self, start, end)?)
    }

    fn property(&self, name: &str) -> Option<String> {
        KvStore::property(self, name)
    }

    fn close(&self) -> Result<()> {
        Ok(KvStore::close(self)?)
    }
}
