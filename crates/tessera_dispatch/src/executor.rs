//! Single-threaded cooperative executor.
//!
//! Tasks are closures handled strictly in submission order by one dedicated
//! worker. Shared state owned by a component is only ever touched from tasks
//! on that component's executor, which stands in for a lock on that state.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a single-threaded FIFO task queue.
///
/// Cloning the handle is cheap; all clones feed the same worker. The queue
/// is unbounded: backpressure, where needed, is applied uniformly upstream
/// at the network edge rather than per component.
#[derive(Clone)]
pub struct Executor {
    tx: mpsc::UnboundedSender<Task>,
    terminated: CancellationToken,
}

impl Executor {
    /// Spawn the worker task and return a handle to it.
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let terminated = CancellationToken::new();
        let token = terminated.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::debug!(executor = name, "executor terminated");
                        break;
                    }
                    task = rx.recv() => match task {
                        Some(task) => task(),
                        None => break,
                    },
                }
            }
        });
        Self { tx, terminated }
    }

    /// Submit a task. Returns `false` iff the executor has terminated, in
    /// which case the task will never run.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.terminated.is_cancelled() {
            return false;
        }
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Signal termination. Queued tasks that have not yet started are
    /// dropped without running.
    pub fn terminate(&self) {
        self.terminated.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Token observed by callers that need to compose cancellation with
    /// their own completion signals.
    pub fn terminated_token(&self) -> CancellationToken {
        self.terminated.clone()
    }

    /// Wait until every task enqueued before this call has run.
    ///
    /// Returns `false` if the executor terminated first.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel::<()>();
        if !self.enqueue(move || {
            let _ = tx.send(());
        }) {
            return false;
        }
        rx.await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let exe = Executor::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..64 {
            let seen = seen.clone();
            assert!(exe.enqueue(move || seen.lock().unwrap().push(n)));
        }
        assert!(exe.flush().await);
        assert_eq!(*seen.lock().unwrap(), (0..64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn enqueue_after_terminate_is_refused() {
        let exe = Executor::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        exe.terminate();
        let ran2 = ran.clone();
        assert!(!exe.enqueue(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!exe.flush().await);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tasks_enqueued_from_tasks_run_after_earlier_tasks() {
        let exe = Executor::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner_exe = exe.clone();
        let seen_a = seen.clone();
        let seen_b = seen.clone();
        exe.enqueue(move || {
            let seen_inner = seen_a.clone();
            inner_exe.enqueue(move || seen_inner.lock().unwrap().push("follow-up"));
            seen_a.lock().unwrap().push("first");
        });
        exe.enqueue(move || seen_b.lock().unwrap().push("second"));
        exe.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "follow-up"]);
    }
}
