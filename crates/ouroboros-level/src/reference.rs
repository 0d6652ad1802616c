//! Buffer pinning for in-flight operations
//!
//! Keys and values move into an operation as `Bytes`. The operation's
//! `Pinned` set holds a reference to each buffer until the caller receives
//! the result, so the bytes outlive the worker regardless of what the caller
//! does with its own handles.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts buffers currently pinned by in-flight operations
#[derive(Debug, Default)]
pub struct ReferenceTracker {
    live_pins: AtomicUsize,
    pinned_bytes: AtomicUsize,
}

impl ReferenceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pin `buffers` for the duration of one operation
    pub fn pin(self: &Arc<Self>, buffers: Vec<Bytes>) -> Pinned {
        let bytes = buffers.iter().map(Bytes::len).sum();
        self.live_pins.fetch_add(buffers.len(), Ordering::AcqRel);
        self.pinned_bytes.fetch_add(bytes, Ordering::AcqRel);
        Pinned {
            tracker: Arc::clone(self),
            buffers,
            bytes,
        }
    }

    /// Buffers pinned right now
    pub fn live_pins(&self) -> usize {
        self.live_pins.load(Ordering::Acquire)
    }

    pub fn pinned_bytes(&self) -> usize {
        self.pinned_bytes.load(Ordering::Acquire)
    }
}

/// Buffers held for one operation; released exactly once on drop
#[derive(Debug)]
pub struct Pinned {
    tracker: Arc<ReferenceTracker>,
    buffers: Vec<Bytes>,
    bytes: usize,
}

impl Pinned {
    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.tracker.live_pins.fetch_sub(self.buffers.len(), Ordering::AcqRel);
        self.tracker.pinned_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
