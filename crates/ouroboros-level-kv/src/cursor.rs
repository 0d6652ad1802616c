//! Store cursors
//!
//! A cursor holds no lock between steps. Each move re-seeks from the current
//! key under the memtable read lock at the cursor's pinned sequence.

use crate::engine::StoreInner;
use crate::error::{KvError, Result};
use crate::snapshot::SnapshotId;
use crate::types::Sequence;
use bytes::Bytes;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

pub struct KvCursor {
    store: Arc<StoreInner>,
    sequence: Sequence,
    /// Implicit snapshot owned by this cursor
    owned_snapshot: Option<SnapshotId>,
    current: Option<(Bytes, Bytes)>,
    status: Option<KvError>,
}

impl KvCursor {
    pub(crate) fn new(store: Arc<StoreInner>, sequence: Sequence, owned_snapshot: Option<SnapshotId>) -> Self {
        Self {
            store,
            sequence,
            owned_snapshot,
            current: None,
            status: None,
        }
    }

    /// Sequence this cursor reads at
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    fn forward(&mut self, from: Bound<&[u8]>) {
        if let Err(e) = self.store.ensure_open() {
            self.fail(e);
            return;
        }
        self.current = self.store.table.read().seek_forward(from, self.sequence);
    }

    fn backward(&mut self, to: Bound<&[u8]>) {
        if let Err(e) = self.store.ensure_open() {
            self.fail(e);
            return;
        }
        self.current = self.store.table.read().seek_backward(to, self.sequence);
    }

    fn fail(&mut self, err: KvError) {
        self.current = None;
        self.status = Some(err);
    }

    pub fn seek_to_first(&mut self) {
        self.forward(Bound::Unbounded);
    }

    pub fn seek_to_last(&mut self) {
        self.backward(Bound::Unbounded);
    }

    /// Position at the first key `>= target`
    pub fn seek(&mut self, target: &[u8]) {
        self.forward(Bound::Included(target));
    }

    /// Position at the last key `<= target`
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        self.backward(Bound::Included(target));
    }

    pub fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.forward(Bound::Excluded(key.as_ref()));
        }
    }

    pub fn prev(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.backward(Bound::Excluded(key.as_ref()));
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.current.as_ref().map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.current.as_ref().map(|(_, v)| v)
    }

    /// Error that invalidated the cursor, if any
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for KvCursor {
    fn drop(&mut self) {
        if let Some(id) = self.owned_snapshot.take() {
            // Close clears every pin, so a missing id is expected afterwards
            if self.store.snapshots.release(id).is_err() {
                debug!("Cursor snapshot {} already released", id.0);
            }
        }
    }
}
