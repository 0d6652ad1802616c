//! Database handle
//!
//! Owns one engine and exposes the operation surface. State machine:
//!
//! ```text
//! Unopened -> Opening -> Opened -> Closing -> Closed
//!     ^          |                              |
//!     +----------+ (open failed)                +--> Opening (re-open)
//! ```
//!
//! Dispatched operations count themselves as in flight while their engine
//! call runs; close waits for that count to drain before tearing down
//! iterators, snapshots and the engine.

use crate::batch::WriteBatch;
use crate::dispatcher::{Completion, Dispatcher};
use crate::engine::{Engine, EngineSnapshot};
use crate::error::{LevelError, Result};
use crate::iterator::{IteratorId, IteratorRegistry, LevelIterator, RangeCursor};
use crate::options::{IteratorOptions, OpenOptions, ReadOptions, WriteOptions};
use crate::payload::Payload;
use crate::snapshot::{SnapshotId, SnapshotManager};
use bytes::Bytes;
use ouroboros_level_kv::{BatchOp, KvStore};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a database handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Unopened,
    Opening,
    Opened,
    Closing,
    Closed,
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DbState::Unopened => "unopened",
            DbState::Opening => "opening",
            DbState::Opened => "opened",
            DbState::Closing => "closing",
            DbState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Session<E> {
    state: DbState,
    engine: Option<Arc<E>>,
    /// Cancelled when the open session ends
    token: CancellationToken,
}

/// Marks one operation as in flight until dropped
pub(crate) struct OpGuard<E: Engine> {
    inner: Arc<DbInner<E>>,
}

impl<E: Engine> Drop for OpGuard<E> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// Snapshot reference owned by one read
struct SnapshotPin<E: Engine> {
    inner: Arc<DbInner<E>>,
    engine: Arc<E>,
    id: SnapshotId,
    view: EngineSnapshot,
}

impl<E: Engine> SnapshotPin<E> {
    fn view(&self) -> EngineSnapshot {
        self.view
    }
}

impl<E: Engine> Drop for SnapshotPin<E> {
    fn drop(&mut self) {
        if let Err(e) = self.inner.snapshots.release_ref(self.id, &*self.engine) {
            warn!("Failed to release {}: {}", self.id, e);
        }
    }
}

pub(crate) struct DbInner<E: Engine> {
    location: PathBuf,
    session: Mutex<Session<E>>,
    in_flight: AtomicUsize,
    drained: Notify,
    state_changed: Notify,
    /// Shared by dispatched engine calls, exclusive for `_sync` calls
    sync_gate: RwLock<()>,
    dispatcher: Dispatcher,
    snapshots: SnapshotManager,
    iterators: IteratorRegistry,
}

impl<E: Engine> DbInner<E> {
    fn state(&self) -> DbState {
        self.session.lock().state
    }

    /// Count an operation against the open engine
    pub(crate) fn begin_op(self: &Arc<Self>) -> Result<(Arc<E>, OpGuard<E>)> {
        let session = self.session.lock();
        match (&session.state, &session.engine) {
            (DbState::Opened, Some(engine)) => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                let guard = OpGuard {
                    inner: Arc::clone(self),
                };
                Ok((Arc::clone(engine), guard))
            }
            _ => Err(LevelError::NotOpened),
        }
    }

    /// Dispatch `work` against the engine with `buffers` pinned
    pub(crate) fn run<T, F>(self: &Arc<Self>, buffers: Vec<Bytes>, work: F) -> Completion<T>
    where
        F: FnOnce(&E) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (engine, guard) = match self.begin_op() {
            Ok(op) => op,
            Err(e) => return Completion::ready(Err(e)),
        };
        let pins = self.dispatcher.tracker().pin(buffers);
        let inner = Arc::clone(self);

        self.dispatcher.dispatch(pins, move || {
            let _op = guard;
            let _shared = inner.sync_gate.read();
            work(&engine)
        })
    }

    /// Run `work` inline, serialized against dispatched traffic
    fn run_sync<T>(self: &Arc<Self>, work: impl FnOnce(&E) -> Result<T>) -> Result<T> {
        let (engine, _op) = self.begin_op()?;
        let _exclusive = self.sync_gate.write();
        work(&engine)
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            DbState::Opened => Ok(()),
            _ => Err(LevelError::NotOpened),
        }
    }

    /// Hold a reference on a caller snapshot until the read using it is done
    fn pin_snapshot(self: &Arc<Self>, snapshot: Option<SnapshotId>) -> Result<Option<SnapshotPin<E>>> {
        let engine = {
            let session = self.session.lock();
            match (&session.state, &session.engine) {
                (DbState::Opened, Some(engine)) => Arc::clone(engine),
                _ => return Err(LevelError::NotOpened),
            }
        };
        let id = match snapshot {
            Some(id) => id,
            None => return Ok(None),
        };
        let view = self.snapshots.retain(id)?;
        Ok(Some(SnapshotPin {
            inner: Arc::clone(self),
            engine,
            id,
            view,
        }))
    }

    fn begin_open(&self) -> Result<()> {
        let mut session = self.session.lock();
        match session.state {
            DbState::Unopened | DbState::Closed => {
                session.state = DbState::Opening;
                Ok(())
            }
            DbState::Opening | DbState::Opened => Err(LevelError::InvalidArgument(
                "database is already open".to_string(),
            )),
            DbState::Closing => Err(LevelError::InvalidArgument("database is closing".to_string())),
        }
    }

    fn finish_open(&self, opened: Result<E>) -> Result<()> {
        let result = {
            let mut session = self.session.lock();
            match opened {
                Ok(engine) if session.state == DbState::Opening => {
                    session.state = DbState::Opened;
                    session.engine = Some(Arc::new(engine));
                    session.token = CancellationToken::new();
                    info!("Opened database at {:?}", self.location);
                    Ok(())
                }
                Ok(engine) => {
                    warn!("Database at {:?} left opening state; discarding engine", self.location);
                    if let Err(e) = engine.close() {
                        warn!("Failed to close discarded engine: {}", e);
                    }
                    Err(LevelError::InvalidArgument(format!(
                        "database is {}",
                        session.state
                    )))
                }
                Err(e) => {
                    session.state = DbState::Unopened;
                    warn!("Failed to open database at {:?}: {}", self.location, e);
                    Err(e)
                }
            }
        };
        self.state_changed.notify_waiters();
        result
    }

    pub(crate) async fn close(&self) -> Result<()> {
        loop {
            let changed = self.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut session = self.session.lock();
                match session.state {
                    DbState::Unopened | DbState::Closed => return Ok(()),
                    DbState::Opened => {
                        session.state = DbState::Closing;
                        break;
                    }
                    // Another open or close is running
                    DbState::Opening | DbState::Closing => {}
                }
            }
            changed.await;
        }

        info!("Closing database at {:?}", self.location);
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let pending = self.in_flight.load(Ordering::Acquire);
            if pending == 0 {
                break;
            }
            debug!("Waiting for {} in-flight operations", pending);
            drained.await;
        }

        let (engine, token) = {
            let mut session = self.session.lock();
            (session.engine.take(), session.token.clone())
        };
        token.cancel();

        let invalidated = self.iterators.invalidate_all();
        if invalidated > 0 {
            debug!("Invalidated {} iterators", invalidated);
        }

        let result = match engine {
            Some(engine) => {
                self.snapshots.clear(&*engine);
                engine.close()
            }
            None => Ok(()),
        };

        self.session.lock().state = DbState::Closed;
        self.state_changed.notify_waiters();

        match &result {
            Ok(()) => info!("Closed database at {:?}", self.location),
            Err(e) => error!("Error closing database at {:?}: {}", self.location, e),
        }
        result
    }

    /// Remove an iterator and drop its snapshot reference
    pub(crate) fn end_iterator(self: &Arc<Self>, id: IteratorId) -> Result<()> {
        let (engine, _op) = self.begin_op()?;
        let state = self.iterators.release(id)?;
        state.cursor.lock().take();
        self.snapshots.release_ref(state.snapshot, &*engine)
    }
}

/// Handle to one embedded database
///
/// Not `Clone`: the handle is bound to its caller. Call [`close`](Self::close)
/// before dropping it.
pub struct Database<E: Engine = KvStore> {
    inner: Arc<DbInner<E>>,
}

impl Database {
    /// Database at `location` backed by the default engine
    pub fn new(location: impl AsRef<Path>) -> Result<Self> {
        Self::with_engine(location)
    }
}

impl<E: Engine> Database<E> {
    /// Database at `location` backed by engine `E`
    pub fn with_engine(location: impl AsRef<Path>) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        if location.as_os_str().is_empty() {
            return Err(LevelError::InvalidArgument("location must not be empty".to_string()));
        }

        Ok(Self {
            inner: Arc::new(DbInner {
                location,
                session: Mutex::new(Session {
                    state: DbState::Unopened,
                    engine: None,
                    token: CancellationToken::new(),
                }),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                state_changed: Notify::new(),
                sync_gate: RwLock::new(()),
                dispatcher: Dispatcher::new(None)?,
                snapshots: SnapshotManager::new(),
                iterators: IteratorRegistry::new(),
            }),
        })
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    pub fn state(&self) -> DbState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == DbState::Opened
    }

    /// Operations currently running on workers or inline
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn live_iterators(&self) -> usize {
        self.inner.iterators.len()
    }

    pub fn live_snapshots(&self) -> usize {
        self.inner.snapshots.len()
    }

    /// Buffers pinned by operations whose result is not yet delivered
    pub fn pinned_buffers(&self) -> usize {
        self.inner.dispatcher.tracker().live_pins()
    }

    // ----- lifecycle -----

    /// Open or create the engine on a worker
    pub fn open(&self, options: OpenOptions) -> Completion<()> {
        if let Err(e) = options.validate().and_then(|()| self.inner.begin_open()) {
            return Completion::ready(Err(e));
        }
        info!("Opening database at {:?}", self.inner.location);

        let inner = Arc::clone(&self.inner);
        let pins = self.inner.dispatcher.tracker().pin(Vec::new());
        self.inner.dispatcher.dispatch(pins, move || {
            let opened = E::open(&inner.location, &options);
            inner.finish_open(opened)
        })
    }

    pub fn open_sync(&self, options: OpenOptions) -> Result<()> {
        options.validate()?;
        self.inner.begin_open()?;
        info!("Opening database at {:?}", self.inner.location);
        let opened = E::open(&self.inner.location, &options);
        self.inner.finish_open(opened)
    }

    /// Drain in-flight work, invalidate iterators and snapshots, drop the engine
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn close_sync(&self) -> Result<()> {
        futures::executor::block_on(self.inner.close())
    }

    // ----- point operations -----

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>, options: WriteOptions) -> Completion<()> {
        let (key, value) = (key.into(), value.into());
        let pins = vec![key.clone(), value.clone()];
        self.inner
            .run(pins, move |engine: &E| engine.put(key, value, options.sync))
    }

    pub fn put_sync(&self, key: impl Into<Bytes>, value: impl Into<Bytes>, options: WriteOptions) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.inner.run_sync(|engine| engine.put(key, value, options.sync))
    }

    /// Delete `key`; deleting a missing key succeeds
    pub fn del(&self, key: impl Into<Bytes>, options: WriteOptions) -> Completion<()> {
        let key = key.into();
        self.inner
            .run(vec![key.clone()], move |engine: &E| engine.delete(key, options.sync))
    }

    pub fn del_sync(&self, key: impl Into<Bytes>, options: WriteOptions) -> Result<()> {
        let key = key.into();
        self.inner.run_sync(|engine| engine.delete(key, options.sync))
    }

    /// Value of `key`, or [`LevelError::NotFound`]
    pub fn get(&self, key: impl Into<Bytes>, options: ReadOptions) -> Completion<Payload> {
        let key = key.into();
        let pin = match self.inner.pin_snapshot(options.snapshot) {
            Ok(pin) => pin,
            Err(e) => return Completion::ready(Err(e)),
        };
        self.inner.run(vec![key.clone()], move |engine: &E| {
            let view = pin.as_ref().map(SnapshotPin::view);
            read_value(engine, &key, view, options.as_buffer)
        })
    }

    pub fn get_sync(&self, key: impl Into<Bytes>, options: ReadOptions) -> Result<Payload> {
        let key = key.into();
        let pin = self.inner.pin_snapshot(options.snapshot)?;
        let view = pin.as_ref().map(SnapshotPin::view);
        self.inner
            .run_sync(|engine| read_value(engine, &key, view, options.as_buffer))
    }

    /// Raw bytes of `key`, or [`LevelError::NotFound`]
    pub fn get_buffer_sync(&self, key: impl Into<Bytes>) -> Result<Bytes> {
        self.get_sync(key, ReadOptions::default()).map(Payload::into_bytes)
    }

    pub fn exists(&self, key: impl Into<Bytes>) -> Completion<bool> {
        let key = key.into();
        self.inner.run(vec![key.clone()], move |engine: &E| {
            Ok(engine.get(&key, None)?.is_some())
        })
    }

    pub fn is_exists_sync(&self, key: impl Into<Bytes>) -> Result<bool> {
        let key = key.into();
        self.inner.run_sync(|engine| Ok(engine.get(&key, None)?.is_some()))
    }

    /// One independent result per key, in order
    pub fn multi_get<I, K>(&self, keys: I, options: ReadOptions) -> Completion<Vec<Result<Option<Payload>>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        let pin = match self.inner.pin_snapshot(options.snapshot) {
            Ok(pin) => pin,
            Err(e) => return Completion::ready(Err(e)),
        };
        self.inner.run(keys.clone(), move |engine: &E| {
            let view = pin.as_ref().map(SnapshotPin::view);
            Ok(read_many(engine, &keys, view, options.as_buffer))
        })
    }

    pub fn multi_get_sync<I, K>(&self, keys: I, options: ReadOptions) -> Result<Vec<Result<Option<Payload>>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        let pin = self.inner.pin_snapshot(options.snapshot)?;
        let view = pin.as_ref().map(SnapshotPin::view);
        self.inner
            .run_sync(|engine| Ok(read_many(engine, &keys, view, options.as_buffer)))
    }

    // ----- batches -----

    /// Apply `ops` atomically, in order
    pub fn batch(&self, ops: Vec<BatchOp>, options: WriteOptions) -> Completion<()> {
        let pins = batch_buffers(&ops);
        self.inner
            .run(pins, move |engine: &E| engine.write_batch(&ops, options.sync))
    }

    pub fn batch_sync(&self, ops: Vec<BatchOp>, options: WriteOptions) -> Result<()> {
        self.inner.run_sync(|engine| engine.write_batch(&ops, options.sync))
    }

    /// Apply a chained batch atomically; the batch is consumed
    pub fn write(&self, batch: WriteBatch, options: WriteOptions) -> Completion<()> {
        self.batch(batch.into_ops(), options)
    }

    // ----- introspection -----

    /// Approximate bytes stored for keys in `[start, end)`
    pub fn approximate_size(&self, start: impl Into<Bytes>, end: impl Into<Bytes>) -> Completion<u64> {
        let (start, end) = (start.into(), end.into());
        if let Err(e) = self.inner.check_open().and_then(|()| check_size_range(&start, &end)) {
            return Completion::ready(Err(e));
        }
        self.inner.run(vec![start.clone(), end.clone()], move |engine: &E| {
            engine.approximate_size(&start, &end)
        })
    }

    pub fn approximate_size_sync(&self, start: impl Into<Bytes>, end: impl Into<Bytes>) -> Result<u64> {
        let (start, end) = (start.into(), end.into());
        self.inner.check_open()?;
        check_size_range(&start, &end)?;
        self.inner.run_sync(|engine| engine.approximate_size(&start, &end))
    }

    /// Diagnostic property; empty for unknown names or a database that is not open
    pub fn get_property(&self, name: &str) -> String {
        self.inner
            .run_sync(|engine| Ok(engine.property(name)))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    // ----- iterators and snapshots -----

    /// Create and register a range iterator
    pub fn iterator(&self, options: IteratorOptions) -> Result<LevelIterator<E>> {
        let inner = &self.inner;
        let (engine, _op) = inner.begin_op()?;

        let (snapshot, view) = match options.snapshot {
            Some(id) => (id, inner.snapshots.retain(id)?),
            None => {
                let view = engine.new_snapshot()?;
                (inner.snapshots.attach_implicit(view), view)
            }
        };

        let cursor = match engine.new_cursor(Some(view)) {
            Ok(cursor) => cursor,
            Err(e) => {
                if let Err(release) = inner.snapshots.release_ref(snapshot, &*engine) {
                    warn!("Failed to release {}: {}", snapshot, release);
                }
                return Err(e);
            }
        };

        let token = inner.session.lock().token.child_token();
        let state = inner
            .iterators
            .register(snapshot, RangeCursor::new(cursor, &options), token, &options);
        debug!("Created {} on {}", state.id, snapshot);
        Ok(LevelIterator::new(state, Arc::clone(inner)))
    }

    /// Release a registered iterator by id
    pub fn release_iterator(&self, id: IteratorId) -> Result<()> {
        self.inner.end_iterator(id)
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> Result<SnapshotId> {
        let snapshots = &self.inner.snapshots;
        self.inner.run_sync(|engine| snapshots.acquire(engine))
    }

    /// Release a snapshot; releasing it twice is rejected
    pub fn release_snapshot(&self, id: SnapshotId) -> Result<()> {
        let snapshots = &self.inner.snapshots;
        self.inner.run_sync(|engine| snapshots.release(id, engine))
    }
}

impl<E: Engine> fmt::Debug for Database<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.inner.location)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<E: Engine> Drop for Database<E> {
    fn drop(&mut self) {
        match self.state() {
            DbState::Unopened | DbState::Closed => {}
            state => {
                error!(
                    "Database at {:?} dropped while {}; closing it now",
                    self.inner.location, state
                );
                if let Err(e) = futures::executor::block_on(self.inner.close()) {
                    error!("Teardown of {:?} failed: {}", self.inner.location, e);
                }
            }
        }
    }
}

fn read_value<E: Engine>(
    engine: &E,
    key: &[u8],
    view: Option<EngineSnapshot>,
    as_buffer: bool,
) -> Result<Payload> {
    match engine.get(key, view)? {
        Some(value) => Ok(Payload::from_bytes(value, as_buffer)),
        None => {
            debug!("Key not found ({} bytes)", key.len());
            Err(LevelError::NotFound)
        }
    }
}

fn read_many<E: Engine>(
    engine: &E,
    keys: &[Bytes],
    view: Option<EngineSnapshot>,
    as_buffer: bool,
) -> Vec<Result<Option<Payload>>> {
    keys.iter()
        .map(|key| match read_value(engine, key, view, as_buffer) {
            Ok(value) => Ok(Some(value)),
            Err(LevelError::NotFound) => Ok(None),
            Err(e) => Err(e),
        })
        .collect()
}

fn batch_buffers(ops: &[BatchOp]) -> Vec<Bytes> {
    let mut buffers = Vec::with_capacity(ops.len() * 2);
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                buffers.push(key.clone());
                buffers.push(value.clone());
            }
            BatchOp::Delete { key } => buffers.push(key.clone()),
        }
    }
    buffers
}

fn check_size_range(start: &[u8], end: &[u8]) -> Result<()> {
    if start > end {
        return Err(LevelError::InvalidArgument(
            "start key must not be greater than end key".to_string(),
        ));
    }
    Ok(())
}
