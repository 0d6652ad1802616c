//! Database behavior against a custom engine
//!
//! The engine below blocks reads and cursor steps on a gate so tests can hold
//! an operation in flight and observe what waits for it.

use bytes::Bytes;
use ouroboros_level::{
    BatchOp, Cursor, Database, DbState, Engine, EngineSnapshot, IteratorOptions, LevelError,
    OpenOptions, ReadOptions, Result, WriteOptions,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

static READ_GATE: Mutex<()> = parking_lot::const_mutex(());
/// Reads that reached the gate, by key
static ENTERED: Mutex<BTreeMap<Vec<u8>, usize>> = parking_lot::const_mutex(BTreeMap::new());
static CLOSES: AtomicUsize = AtomicUsize::new(0);

struct GatedEngine {
    data: Mutex<BTreeMap<Bytes, Bytes>>,
    next_view: AtomicU64,
}

struct ListCursor {
    entries: Vec<(Bytes, Bytes)>,
    pos: Option<usize>,
}

impl Cursor for ListCursor {
    fn seek_to_first(&mut self) {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.pos = self.entries.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        self.pos = self.entries.iter().position(|(k, _)| &k[..] >= target);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        self.pos = self.entries.iter().rposition(|(k, _)| &k[..] <= target);
    }

    fn next(&mut self) {
        self.pos = self.pos.map(|p| p + 1).filter(|p| *p < self.entries.len());
    }

    fn prev(&mut self) {
        self.pos = self.pos.and_then(|p| p.checked_sub(1));
    }

    fn valid(&self) -> bool {
        let _gate = READ_GATE.lock();
        self.pos.is_some()
    }

    fn key(&self) -> Option<Bytes> {
        self.pos.map(|p| self.entries[p].0.clone())
    }

    fn value(&self) -> Option<Bytes> {
        self.pos.map(|p| self.entries[p].1.clone())
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

impl Engine for GatedEngine {
    fn open(_path: &Path, _options: &OpenOptions) -> Result<Self> {
        Ok(Self {
            data: Mutex::new(BTreeMap::new()),
            next_view: AtomicU64::new(1),
        })
    }

    fn get(&self, key: &[u8], _snapshot: Option<EngineSnapshot>) -> Result<Option<Bytes>> {
        *ENTERED.lock().entry(key.to_vec()).or_default() += 1;
        let _gate = READ_GATE.lock();
        Ok(self.data.lock().get(key).cloned())
    }

    fn write_batch(&self, ops: &[BatchOp], _sync: bool) -> Result<()> {
        let mut data = self.data.lock();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    fn new_cursor(&self, _snapshot: Option<EngineSnapshot>) -> Result<Box<dyn Cursor>> {
        let entries = self
            .data
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(ListCursor { entries, pos: None }))
    }

    fn new_snapshot(&self) -> Result<EngineSnapshot> {
        Ok(EngineSnapshot(self.next_view.fetch_add(1, Ordering::Relaxed)))
    }

    fn release_snapshot(&self, _snapshot: EngineSnapshot) -> Result<()> {
        Ok(())
    }

    fn approximate_size(&self, _start: &[u8], _end: &[u8]) -> Result<u64> {
        Err(LevelError::NotSupported("size estimates".to_string()))
    }

    fn property(&self, name: &str) -> Option<String> {
        (name == "gated.entries").then(|| self.data.lock().len().to_string())
    }

    fn close(&self) -> Result<()> {
        CLOSES.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn gated_db(dir: &TempDir) -> Database<GatedEngine> {
    let db = Database::<GatedEngine>::with_engine(dir.path()).unwrap();
    db.open_sync(OpenOptions::default()).unwrap();
    db
}

async fn wait_for_in_flight(db: &Database<GatedEngine>, count: usize) {
    for _ in 0..200 {
        if db.in_flight() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("in-flight count never reached {}", count);
}

async fn wait_for_read_at_gate(key: &[u8]) {
    for _ in 0..200 {
        if ENTERED.lock().contains_key(key) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("read of {:?} never reached the gate", key);
}

#[tokio::test]
async fn test_close_waits_for_in_flight_operations() {
    let dir = TempDir::new().unwrap();
    let db = gated_db(&dir);
    db.put_sync("k", "v", WriteOptions::default()).unwrap();

    let held = READ_GATE.lock();
    let read = db.get("k", ReadOptions::default());
    wait_for_in_flight(&db, 1).await;

    let closes_before = CLOSES.load(Ordering::SeqCst);
    let close = db.close();
    tokio::pin!(close);

    // Close cannot finish while the read holds the engine
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut close).await.is_err());
    assert_eq!(db.state(), DbState::Closing);
    assert_eq!(db.put("x", "y", WriteOptions::default()).await, Err(LevelError::NotOpened));
    assert!(matches!(db.open(OpenOptions::default()).await, Err(LevelError::InvalidArgument(_))));

    drop(held);
    close.await.unwrap();
    assert_eq!(db.state(), DbState::Closed);
    assert!(CLOSES.load(Ordering::SeqCst) > closes_before);

    // The read still completes exactly once
    assert_eq!(read.await.unwrap().as_bytes(), b"v");
    assert_eq!(db.pinned_buffers(), 0);
}

#[tokio::test]
async fn test_engine_errors_surface_verbatim() {
    let dir = TempDir::new().unwrap();
    let db = gated_db(&dir);

    let err = db.approximate_size("a", "b").await.unwrap_err();
    assert_eq!(err, LevelError::NotSupported("size estimates".to_string()));
    assert_eq!(err.status().code(), 3);

    db.put("a", "1", WriteOptions::default()).await.unwrap();
    assert_eq!(db.get_property("gated.entries"), "1");
    assert_eq!(db.get_property("unknown"), "");

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_close_calls_share_one_teardown() {
    let dir = TempDir::new().unwrap();
    let db = gated_db(&dir);

    let mut iter = db.iterator(IteratorOptions::new()).unwrap();
    let (first, second) = tokio::join!(db.close(), db.close());
    first.unwrap();
    second.unwrap();

    assert_eq!(db.state(), DbState::Closed);
    assert_eq!(iter.next().await.unwrap(), None);
    assert_eq!(db.live_iterators(), 0);
}

#[test]
fn test_drop_without_close_is_torn_down() {
    let dir = TempDir::new().unwrap();
    let closes_before = CLOSES.load(Ordering::SeqCst);
    {
        let db = gated_db(&dir);
        db.put_sync("k", "v", WriteOptions::default()).unwrap();
    }
    assert!(CLOSES.load(Ordering::SeqCst) > closes_before);
}

#[tokio::test]
async fn test_sync_call_waits_for_dispatched_engine_call() {
    let dir = TempDir::new().unwrap();
    let db = gated_db(&dir);
    db.put_sync("gated-read", "v", WriteOptions::default()).unwrap();

    let held = READ_GATE.lock();
    let read = db.get("gated-read", ReadOptions::default());
    wait_for_read_at_gate(b"gated-read").await;

    let written = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            db.put_sync("after", "1", WriteOptions::default()).unwrap();
            written.store(true, Ordering::SeqCst);
        });

        // The dispatched read holds the engine, so the sync write waits
        std::thread::sleep(Duration::from_millis(50));
        assert!(!written.load(Ordering::SeqCst));

        drop(held);
        writer.join().unwrap();
    });
    assert!(written.load(Ordering::SeqCst));

    assert_eq!(read.await.unwrap().as_bytes(), b"v");
    assert_eq!(db.get_buffer_sync("after").unwrap(), Bytes::from_static(b"1"));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_sync_applies_in_order() {
    let dir = TempDir::new().unwrap();
    let db = gated_db(&dir);

    let ops = vec![
        BatchOp::put("x", "1"),
        BatchOp::put("y", "2"),
        BatchOp::delete("x"),
    ];
    db.batch_sync(ops, WriteOptions::sync()).unwrap();

    assert!(!db.is_exists_sync("x").unwrap());
    assert_eq!(db.get_sync("y", ReadOptions::default()).unwrap().as_bytes(), b"2");
    assert_eq!(db.get_property("gated.entries"), "1");

    db.batch_sync(Vec::new(), WriteOptions::default()).unwrap();
    db.close().await.unwrap();
    assert_eq!(
        db.batch_sync(vec![BatchOp::delete("y")], WriteOptions::default()),
        Err(LevelError::NotOpened)
    );
}

#[tokio::test]
async fn test_dropped_next_does_not_skip_an_entry() {
    let dir = TempDir::new().unwrap();
    let db = gated_db(&dir);
    db.put_sync("a", "1", WriteOptions::default()).unwrap();
    db.put_sync("b", "2", WriteOptions::default()).unwrap();

    let mut iter = db.iterator(IteratorOptions::new()).unwrap();
    let held = READ_GATE.lock();
    assert!(tokio::time::timeout(Duration::from_millis(20), iter.next()).await.is_err());
    drop(held);

    let (key, value) = iter.next().await.unwrap().unwrap();
    assert_eq!((key.as_bytes(), value.as_bytes()), (&b"a"[..], &b"1"[..]));
    let (key, _) = iter.next().await.unwrap().unwrap();
    assert_eq!(key.as_bytes(), b"b");
    assert_eq!(iter.next().await.unwrap(), None);

    iter.end().unwrap();
    db.close().await.unwrap();
}
