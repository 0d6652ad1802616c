///! Background WAL flusher
///!
///! Writers append to the shared WAL buffer on the caller's thread; this
///! thread fsyncs whatever is pending once per flush interval.

use super::wal::WalWriter;
use super::{PersistenceError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Command sent to the flusher thread
enum FlushCommand {
    /// Fsync now
    Flush,

    /// Final fsync and exit
    Shutdown,
}

/// Handle to the background flusher thread
pub struct FlushHandle {
    sender: Sender<FlushCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FlushHandle {
    /// Spawn the flusher for `wal`
    pub fn spawn(wal: Arc<Mutex<WalWriter>>, interval: Duration) -> Result<Self> {
        let (sender, receiver) = bounded::<FlushCommand>(16);

        let thread_handle = thread::Builder::new()
            .name("level-wal-flush".to_string())
            .spawn(move || Self::flush_thread(wal, receiver, interval))
            .map_err(PersistenceError::Io)?;

        debug!("WAL flusher started ({:?} interval)", interval);

        Ok(Self {
            sender,
            thread_handle: Some(thread_handle),
        })
    }

    /// Request an fsync without waiting for it
    pub fn flush(&self) {
        let _ = self.sender.try_send(FlushCommand::Flush);
    }

    fn flush_thread(wal: Arc<Mutex<WalWriter>>, receiver: Receiver<FlushCommand>, interval: Duration) {
        loop {
            match receiver.recv_timeout(interval) {
                Ok(FlushCommand::Flush) => {
                    if let Err(e) = wal.lock().flush() {
                        error!("Failed to flush WAL: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut writer = wal.lock();
                    if writer.should_flush() {
                        if let Err(e) = writer.flush() {
                            error!("Failed to flush WAL: {}", e);
                        }
                    }
                }
                Ok(FlushCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Err(e) = wal.lock().flush() {
            error!("Failed final WAL flush: {}", e);
        }
        debug!("WAL flusher stopped");
    }

    fn shutdown_internal(&mut self) -> Result<()> {
        let _ = self.sender.send(FlushCommand::Shutdown);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                return Err(PersistenceError::DataDirectory(
                    "WAL flusher thread panicked".to_string(),
                ));
            }
            info!("WAL flusher shut down");
        }

        Ok(())
    }

    /// Stop the thread after a final fsync (consumes self)
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_internal()
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("FlushHandle dropped without explicit shutdown, forcing shutdown");
            let _ = self.shutdown_internal();
        }
    }
}
