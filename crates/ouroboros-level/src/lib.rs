//! Async access layer over an embedded, ordered key-value engine
//!
//! A [`Database`] owns one engine handle and exposes open/close, point
//! reads and writes, atomic batches, range iterators, snapshots and size and
//! property introspection. Blocking engine calls run on a shared worker pool;
//! every dispatched call resolves exactly once through a [`Completion`].
//!
//! ```no_run
//! # async fn demo() -> ouroboros_level::Result<()> {
//! use ouroboros_level::{Database, OpenOptions, ReadOptions, WriteOptions};
//!
//! let db = Database::new("/tmp/example-db")?;
//! db.open(OpenOptions::default()).await?;
//! db.put("key", "value", WriteOptions::default()).await?;
//! let value = db.get("key", ReadOptions::default()).await?;
//! assert_eq!(value.as_bytes(), b"value");
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod database;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod iterator;
pub mod options;
pub mod payload;
pub mod reference;
pub mod snapshot;

use std::sync::Arc;
use tokio::runtime::Runtime;

pub use batch::WriteBatch;
pub use database::{Database, DbState};
pub use dispatcher::{Completion, Dispatcher};
pub use engine::{Cursor, Engine, EngineSnapshot};
pub use error::{LevelError, Result, Status};
pub use iterator::{IteratorId, LevelIterator};
pub use options::{IteratorOptions, OpenOptions, ReadOptions, WriteOptions};
pub use ouroboros_level_kv::{BatchOp, KvStore};
pub use payload::Payload;
pub use snapshot::SnapshotId;

fn init_runtime() -> Result<Arc<Runtime>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .thread_name("level-worker")
        .enable_all()
        .build()
        .map_err(|e| LevelError::Io(format!("failed to start runtime: {}", e)))?;

    Ok(Arc::new(runtime))
}

/// Get or create the shared Tokio runtime.
///
/// Initialized once and shared by every database in the process.
pub fn get_runtime() -> Result<Arc<Runtime>> {
    use once_cell::sync::Lazy;

    static RUNTIME: Lazy<Result<Arc<Runtime>>> = Lazy::new(init_runtime);

    match &*RUNTIME {
        Ok(rt) => Ok(Arc::clone(rt)),
        Err(e) => Err(e.clone()),
    }
}
