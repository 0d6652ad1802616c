//! Task dispatcher
//!
//! Runs blocking engine calls on the shared runtime's blocking pool and
//! hands each result back through a one-shot channel wrapped in a
//! `Completion` future.

use crate::error::{LevelError, Result};
use crate::reference::{Pinned, ReferenceTracker};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, Semaphore};
use tracing::error;

/// Result of one unit of work plus the buffers it kept alive
struct Delivery<T> {
    result: Result<T>,
    pins: Option<Pinned>,
}

enum CompletionState<T> {
    Ready(Option<Result<T>>),
    Pending(oneshot::Receiver<Delivery<T>>),
}

/// Single notification for a dispatched operation
///
/// Resolves exactly once. The operation's pinned buffers are released when
/// the result is handed over.
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

// The result is moved out, never pinned in place
impl<T> Unpin for Completion<T> {}

impl<T> Completion<T> {
    /// A completion that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: CompletionState::Ready(Some(result)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            CompletionState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(LevelError::InvalidArgument("completion polled after resolving".to_string()))
            })),
            CompletionState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(delivery)) => {
                    this.state = CompletionState::Ready(None);
                    drop(delivery.pins);
                    Poll::Ready(delivery.result)
                }
                Poll::Ready(Err(_)) => {
                    this.state = CompletionState::Ready(None);
                    Poll::Ready(Err(LevelError::Io("operation was dropped by its worker".to_string())))
                }
            },
        }
    }
}

/// Semaphore-bounded blocking executor on the shared runtime
pub struct Dispatcher {
    runtime: Arc<Runtime>,
    semaphore: Arc<Semaphore>,
    tracker: Arc<ReferenceTracker>,
    max_workers: usize,
}

impl Dispatcher {
    /// Create a dispatcher (None = CPU count workers)
    pub fn new(max_workers: Option<usize>) -> Result<Self> {
        let max_workers = max_workers.unwrap_or_else(num_cpus::get).max(1);
        Ok(Self {
            runtime: crate::get_runtime()?,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            tracker: ReferenceTracker::new(),
            max_workers,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn tracker(&self) -> &Arc<ReferenceTracker> {
        &self.tracker
    }

    /// Run `work` on a worker; `pins` stay alive until the caller sees the result
    pub fn dispatch<T, F>(&self, pins: Pinned, work: F) -> Completion<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let semaphore = Arc::clone(&self.semaphore);

        self.runtime.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = tx.send(Delivery {
                        result: Err(LevelError::Io("dispatcher shut down".to_string())),
                        pins: Some(pins),
                    });
                    return;
                }
            };

            let outcome = tokio::task::spawn_blocking(move || {
                let result = work();
                drop(permit);
                Delivery {
                    result,
                    pins: Some(pins),
                }
            })
            .await;

            let delivery = match outcome {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!("Worker failed: {}", e);
                    Delivery {
                        result: Err(LevelError::Io(format!("worker panicked: {}", e))),
                        pins: None,
                    }
                }
            };

            // Receiver gone means the caller stopped waiting; nothing to notify
            let _ = tx.send(delivery);
        });

        Completion {
            state: CompletionState::Pending(rx),
        }
    }
}
