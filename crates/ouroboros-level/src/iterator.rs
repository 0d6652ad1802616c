//! Iterator registry and range iterators
//!
//! Every live iterator is registered under a stable id. The registry owns
//! the engine cursor; the caller's [`LevelIterator`] only refers to it, so
//! closing the database can invalidate all cursors whatever handles remain.

use crate::database::DbInner;
use crate::engine::{Cursor, Engine};
use crate::error::{LevelError, Result};
use crate::options::IteratorOptions;
use crate::payload::Payload;
use crate::snapshot::SnapshotId;
use bytes::Bytes;
use futures::stream::{self, Stream};
use ouroboros_level_kv::KvStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Registry handle of a live iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IteratorId(pub u32);

impl fmt::Display for IteratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iterator-{}", self.0)
    }
}

/// Lower and upper key bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyRange {
    lower: Bound<Bytes>,
    upper: Bound<Bytes>,
}

impl KeyRange {
    pub(crate) fn from_options(options: &IteratorOptions) -> Self {
        let lower = match (&options.gt, &options.gte) {
            (Some(key), _) => Bound::Excluded(key.clone()),
            (None, Some(key)) => Bound::Included(key.clone()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (&options.lt, &options.lte) {
            (Some(key), _) => Bound::Excluded(key.clone()),
            (None, Some(key)) => Bound::Included(key.clone()),
            (None, None) => Bound::Unbounded,
        };
        Self { lower, upper }
    }

    /// No key can satisfy both bounds
    pub(crate) fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => key >= &lo[..],
            Bound::Excluded(lo) => key > &lo[..],
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => key <= &hi[..],
            Bound::Excluded(hi) => key < &hi[..],
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// Engine cursor constrained to a range, a direction and a limit
pub(crate) struct RangeCursor {
    cursor: Box<dyn Cursor>,
    range: KeyRange,
    reverse: bool,
    remaining: Option<usize>,
    started: bool,
    exhausted: bool,
    pending_seek: Option<Bytes>,
}

impl RangeCursor {
    pub(crate) fn new(cursor: Box<dyn Cursor>, options: &IteratorOptions) -> Self {
        let range = KeyRange::from_options(options);
        let exhausted = range.is_empty() || options.limit == 0;
        let remaining = usize::try_from(options.limit).ok();
        Self {
            cursor,
            range,
            reverse: options.reverse,
            remaining,
            started: false,
            exhausted,
            pending_seek: None,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Reposition for the next read; ignored once the range has ended
    pub(crate) fn seek(&mut self, target: Bytes) {
        if !self.exhausted {
            self.pending_seek = Some(target);
        }
    }

    fn start(&mut self) {
        if self.reverse {
            match &self.range.upper {
                Bound::Unbounded => self.cursor.seek_to_last(),
                Bound::Included(key) => self.cursor.seek_for_prev(key),
                Bound::Excluded(key) => {
                    self.cursor.seek_for_prev(key);
                    if self.cursor.key().as_ref() == Some(key) {
                        self.cursor.prev();
                    }
                }
            }
        } else {
            match &self.range.lower {
                Bound::Unbounded => self.cursor.seek_to_first(),
                Bound::Included(key) => self.cursor.seek(key),
                Bound::Excluded(key) => {
                    self.cursor.seek(key);
                    if self.cursor.key().as_ref() == Some(key) {
                        self.cursor.next();
                    }
                }
            }
        }
    }

    fn position(&mut self) {
        if let Some(target) = self.pending_seek.take() {
            if self.reverse {
                self.cursor.seek_for_prev(&target);
            } else {
                self.cursor.seek(&target);
            }
            self.started = true;
        } else if !self.started {
            self.started = true;
            self.start();
        } else if self.reverse {
            self.cursor.prev();
        } else {
            self.cursor.next();
        }
    }

    /// Next in-range entry, `None` at end of range
    pub(crate) fn advance(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        if self.exhausted {
            return Ok(None);
        }
        self.position();

        if !self.cursor.valid() {
            self.exhausted = true;
            self.cursor.status()?;
            return Ok(None);
        }

        let (key, value) = match (self.cursor.key(), self.cursor.value()) {
            (Some(key), Some(value)) => (key, value),
            _ => {
                self.exhausted = true;
                return Ok(None);
            }
        };
        if !self.range.contains(&key) {
            self.exhausted = true;
            return Ok(None);
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.exhausted = true;
            }
        }
        Ok(Some((key, value)))
    }
}

/// Registry entry of a live iterator
pub(crate) struct IteratorState {
    pub(crate) id: IteratorId,
    pub(crate) snapshot: SnapshotId,
    pub(crate) cursor: Mutex<Option<RangeCursor>>,
    /// Entry read by a worker but not yet handed to the caller
    pending: Mutex<Option<(Bytes, Bytes)>>,
    pub(crate) token: CancellationToken,
    key_as_buffer: bool,
    value_as_buffer: bool,
}

impl IteratorState {
    fn is_live(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let cursor = self.cursor.lock();
        let pending = self.pending.lock().is_some();
        pending || cursor.as_ref().map_or(false, |cursor| !cursor.is_exhausted())
    }

    /// Advance into the pending slot unless an entry is already waiting there
    fn fill_pending(&self) -> Result<()> {
        let mut cursor = self.cursor.lock();
        let mut pending = self.pending.lock();
        if pending.is_none() {
            if let Some(cursor) = cursor.as_mut() {
                *pending = cursor.advance()?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct IteratorRegistry {
    next_id: AtomicU32,
    live: Mutex<BTreeMap<IteratorId, Arc<IteratorState>>>,
}

impl IteratorRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        snapshot: SnapshotId,
        cursor: RangeCursor,
        token: CancellationToken,
        options: &IteratorOptions,
    ) -> Arc<IteratorState> {
        let id = IteratorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(IteratorState {
            id,
            snapshot,
            cursor: Mutex::new(Some(cursor)),
            pending: Mutex::new(None),
            token,
            key_as_buffer: options.key_as_buffer,
            value_as_buffer: options.value_as_buffer,
        });
        self.live.lock().insert(id, Arc::clone(&state));
        state
    }

    /// Remove an iterator; unknown ids are rejected
    pub(crate) fn release(&self, id: IteratorId) -> Result<Arc<IteratorState>> {
        self.live
            .lock()
            .remove(&id)
            .ok_or_else(|| LevelError::InvalidArgument(format!("unknown {}", id)))
    }

    /// End every registered iterator and drop its cursor
    pub(crate) fn invalidate_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.live.lock());
        for state in drained.values() {
            state.cursor.lock().take();
        }
        drained.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }
}

/// Caller handle to a registered range iterator
///
/// Reads are dispatched to the worker pool; `&mut self` keeps them ordered.
/// Dropping the handle releases the iterator.
pub struct LevelIterator<E: Engine = KvStore> {
    state: Arc<IteratorState>,
    db: Arc<DbInner<E>>,
    ended: bool,
}

impl<E: Engine> LevelIterator<E> {
    pub(crate) fn new(state: Arc<IteratorState>, db: Arc<DbInner<E>>) -> Self {
        Self {
            state,
            db,
            ended: false,
        }
    }

    pub fn id(&self) -> IteratorId {
        self.state.id
    }

    /// Snapshot this iterator reads from
    pub fn snapshot(&self) -> SnapshotId {
        self.state.snapshot
    }

    /// Whether another read may still yield an entry
    pub fn is_valid(&self) -> bool {
        !self.ended && self.state.is_live()
    }

    /// Next entry in range, `None` once the iterator has ended or the
    /// database was closed
    ///
    /// Cancel-safe: an entry read for a dropped call is returned by the next one.
    pub async fn next(&mut self) -> Result<Option<(Payload, Payload)>> {
        if self.ended || self.state.token.is_cancelled() {
            return Ok(None);
        }

        let state = Arc::clone(&self.state);
        let read = self
            .db
            .run(Vec::new(), move |_engine: &E| {
                if state.token.is_cancelled() {
                    return Ok(());
                }
                state.fill_pending()
            })
            .await;

        match read {
            Ok(()) => Ok(self.state.pending.lock().take().map(|(key, value)| {
                (
                    Payload::from_bytes(key, self.state.key_as_buffer),
                    Payload::from_bytes(value, self.state.value_as_buffer),
                )
            })),
            Err(LevelError::NotOpened) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reposition within the same bounds
    pub fn seek(&mut self, target: impl Into<Bytes>) {
        if self.ended {
            return;
        }
        let mut cursor = self.state.cursor.lock();
        self.state.pending.lock().take();
        if let Some(cursor) = cursor.as_mut() {
            cursor.seek(target.into());
        }
    }

    /// Release the iterator and its snapshot reference
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        match self.db.end_iterator(self.state.id) {
            // Already invalidated by close
            Err(LevelError::NotOpened) | Err(LevelError::InvalidArgument(_)) => Ok(()),
            other => other,
        }
    }

    /// Consume the handle as a stream of entries
    pub fn into_stream(self) -> impl Stream<Item = Result<(Payload, Payload)>> {
        stream::unfold(self, |mut iter| async move {
            match iter.next().await {
                Ok(Some(entry)) => Some((Ok(entry), iter)),
                Ok(None) => None,
                Err(e) => Some((Err(e), iter)),
            }
        })
    }
}

impl<E: Engine> fmt::Debug for LevelIterator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelIterator")
            .field("id", &self.state.id)
            .field("snapshot", &self.state.snapshot)
            .field("ended", &self.ended)
            .finish()
    }
}

impl<E: Engine> Drop for LevelIterator<E> {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            warn!("Failed to release {}: {}", self.state.id, e);
        } else {
            debug!("Released {}", self.state.id);
        }
    }
}
