//! Pinned read sequences

use crate::error::{KvError, Result};
use crate::types::Sequence;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to a pinned snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

/// Tracks pinned snapshots and the minimum pinned sequence.
///
/// A snapshot id is distinct from the sequence it pins; several snapshots
/// may pin the same sequence.
#[derive(Debug)]
pub struct SnapshotTracker {
    next_id: AtomicU64,
    pinned: Mutex<BTreeMap<u64, Sequence>>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pinned: Mutex::new(BTreeMap::new()),
        }
    }

    /// Pin `sequence` and return its handle
    pub fn pin(&self, sequence: Sequence) -> SnapshotId {
        let id = SnapshotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pinned.lock().insert(id.0, sequence);
        id
    }

    pub fn release(&self, id: SnapshotId) -> Result<()> {
        match self.pinned.lock().remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(KvError::InvalidArgument(format!("unknown snapshot id {}", id.0))),
        }
    }

    /// Sequence pinned by `id`
    pub fn resolve(&self, id: SnapshotId) -> Result<Sequence> {
        self.pinned
            .lock()
            .get(&id.0)
            .copied()
            .ok_or_else(|| KvError::InvalidArgument(format!("unknown snapshot id {}", id.0)))
    }

    /// Oldest pinned sequence, or `latest` when nothing is pinned
    pub fn min_pinned(&self, latest: Sequence) -> Sequence {
        self.pinned
            .lock()
            .values()
            .copied()
            .min()
            .map_or(latest, |seq| seq.min(latest))
    }

    pub fn len(&self) -> usize {
        self.pinned.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.lock().is_empty()
    }

    /// Drop every pin
    pub fn clear(&self) {
        self.pinned.lock().clear();
    }
}

impl Default for SnapshotTracker {
    fn default() -> Self {
        Self::new()
    }
}
