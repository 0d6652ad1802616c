//! Snapshot manager
//!
//! Maps caller-visible snapshot ids onto engine views. Each id carries a
//! share count: one for the caller's explicit hold plus one per iterator
//! built against it. The engine view is released when the count hits zero.

use crate::engine::{Engine, EngineSnapshot};
use crate::error::{LevelError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Caller-visible snapshot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

#[derive(Debug)]
struct SnapshotEntry {
    engine: EngineSnapshot,
    refs: usize,
    /// Explicit caller hold still outstanding
    held: bool,
}

#[derive(Debug)]
pub struct SnapshotManager {
    next_id: AtomicU64,
    entries: Mutex<HashMap<SnapshotId, SnapshotEntry>>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn allocate(&self, engine: EngineSnapshot, held: bool) -> SnapshotId {
        let id = SnapshotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(id, SnapshotEntry { engine, refs: 1, held });
        id
    }

    /// Take a new engine view held by the caller
    pub fn acquire<E: Engine>(&self, engine: &E) -> Result<SnapshotId> {
        let view = engine.new_snapshot()?;
        let id = self.allocate(view, true);
        debug!("Acquired {} (engine view {})", id, view.0);
        Ok(id)
    }

    /// Register a view owned only by one iterator
    pub fn attach_implicit(&self, view: EngineSnapshot) -> SnapshotId {
        self.allocate(view, false)
    }

    /// Add an iterator reference to a caller-held snapshot
    pub fn retain(&self, id: SnapshotId) -> Result<EngineSnapshot> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if entry.held => {
                entry.refs += 1;
                Ok(entry.engine)
            }
            _ => Err(LevelError::InvalidArgument(format!("unknown {}", id))),
        }
    }

    /// Drop the caller's hold; a second release is rejected
    pub fn release<E: Engine>(&self, id: SnapshotId, engine: &E) -> Result<()> {
        let freed = {
            let mut entries = self.entries.lock();
            let entry = match entries.get_mut(&id) {
                Some(entry) if entry.held => entry,
                _ => {
                    return Err(LevelError::InvalidArgument(format!(
                        "{} is not held",
                        id
                    )))
                }
            };
            entry.held = false;
            Self::decrement(&mut entries, id)
        };
        Self::free(freed, engine)
    }

    /// Drop one iterator reference
    pub fn release_ref<E: Engine>(&self, id: SnapshotId, engine: &E) -> Result<()> {
        let freed = Self::decrement(&mut self.entries.lock(), id);
        Self::free(freed, engine)
    }

    fn decrement(entries: &mut HashMap<SnapshotId, SnapshotEntry>, id: SnapshotId) -> Option<EngineSnapshot> {
        let entry = entries.get_mut(&id)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(&id).map(|e| e.engine)
        } else {
            None
        }
    }

    fn free<E: Engine>(view: Option<EngineSnapshot>, engine: &E) -> Result<()> {
        match view {
            Some(view) => {
                debug!("Releasing engine view {}", view.0);
                engine.release_snapshot(view)
            }
            None => Ok(()),
        }
    }

    /// Release every view back to the engine
    pub fn clear<E: Engine>(&self, engine: &E) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (id, entry) in drained {
            if let Err(e) = engine.release_snapshot(entry.engine) {
                warn!("Failed to release {}: {}", id, e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OpenOptions;
    use ouroboros_level_kv::KvStore;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> KvStore {
        <KvStore as Engine>::open(&dir.path().join("db"), &OpenOptions::default()).unwrap()
    }

    #[test]
    fn test_double_release_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let manager = SnapshotManager::new();

        let id = manager.acquire(&engine).unwrap();
        assert_eq!(manager.len(), 1);
        manager.release(id, &engine).unwrap();
        assert!(manager.is_empty());

        let err = manager.release(id, &engine).unwrap_err();
        assert!(matches!(err, LevelError::InvalidArgument(_)));
        assert_eq!(engine.property("ouroboros.snapshots").as_deref(), Some("0"));
    }

    #[test]
    fn test_iterator_ref_outlives_caller_hold() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let manager = SnapshotManager::new();

        let id = manager.acquire(&engine).unwrap();
        let view = manager.retain(id).unwrap();
        manager.release(id, &engine).unwrap();

        // Still alive for the iterator, but no longer usable by the caller
        assert_eq!(manager.len(), 1);
        assert!(manager.retain(id).is_err());
        assert!(manager.release(id, &engine).is_err());

        manager.release_ref(id, &engine).unwrap();
        assert!(manager.is_empty());
        assert!(Engine::release_snapshot(&engine, view).is_err());
    }

    #[test]
    fn test_implicit_snapshot_and_clear() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let manager = SnapshotManager::new();

        let view = Engine::new_snapshot(&engine).unwrap();
        let implicit = manager.attach_implicit(view);
        assert!(manager.retain(implicit).is_err());

        manager.acquire(&engine).unwrap();
        assert_eq!(manager.len(), 2);
        manager.clear(&engine);
        assert!(manager.is_empty());
        assert_eq!(engine.property("ouroboros.snapshots").as_deref(), Some("0"));
    }
}
