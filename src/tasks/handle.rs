use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Failure of a task that was accepted by the pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked; the payload message is kept when it is a string.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The task was dropped without ever producing an outcome.
    #[error("Task was dropped before producing a result")]
    Abandoned,
}

/// The eventual outcome of a submitted task.
///
/// Owned by the caller; the pool keeps nothing once the task has run. Dropping
/// a handle does not cancel the task, its outcome is simply discarded.
///
/// The outcome can be obtained by blocking with [`TaskHandle::wait`] or by
/// awaiting the handle from async code.
pub struct TaskHandle<T> {
    id: u64,
    receiver: oneshot::Receiver<Result<T, TaskError>>,
    finished: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        id: u64,
        receiver: oneshot::Receiver<Result<T, TaskError>>,
        finished: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            receiver,
            finished,
        }
    }

    /// Position of the task in its pool's submission sequence.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the task has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Block the current thread until the task has run.
    ///
    /// Must not be called from within an async runtime; await the handle there.
    pub fn wait(self) -> Result<T, TaskError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TaskError::Abandoned))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Abandoned)))
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::WorkerPool;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_task_value() {
        let pool = WorkerPool::new("handle-wait", 1).unwrap();
        let handle = pool.submit(|| "done".to_string()).unwrap();
        assert_eq!(handle.wait().unwrap(), "done");
    }

    #[test]
    fn test_is_finished_flips_after_completion() {
        let pool = WorkerPool::new("handle-finished", 1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let handle = pool
            .submit(move || {
                let _ = gate_rx.recv();
            })
            .unwrap();
        assert!(!handle.is_finished());

        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert!(handle.is_finished());
    }

    #[test]
    fn test_fallible_task_error_is_the_value() {
        let pool = WorkerPool::new("handle-fallible", 1).unwrap();
        let handle = pool
            .submit(|| -> Result<u32, String> { Err("sync failed".to_string()) })
            .unwrap();

        // The task ran fine; its own error is part of the delivered value.
        assert_eq!(handle.wait().unwrap(), Err("sync failed".to_string()));
    }

    #[test]
    fn test_dropped_sender_reports_abandoned() {
        let (tx, rx) = oneshot::channel::<Result<(), TaskError>>();
        drop(tx);
        let handle = TaskHandle::new(0, rx, Arc::new(AtomicBool::new(false)));
        assert_eq!(handle.wait(), Err(TaskError::Abandoned));
    }

    #[test]
    fn test_debug_output_mentions_id() {
        let pool = WorkerPool::new("handle-debug", 1).unwrap();
        let handle = pool.submit(|| ()).unwrap();
        assert!(format!("{:?}", handle).contains("id: 0"));
    }

    #[tokio::test]
    async fn test_handle_can_be_awaited() {
        let pool = WorkerPool::new("handle-async", 2).unwrap();
        let handle = pool
            .submit(|| {
                std::thread::sleep(Duration::from_millis(10));
                21 * 2
            })
            .unwrap();

        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_awaited_panic_is_reported() {
        let pool = WorkerPool::new("handle-async-panic", 1).unwrap();
        let handle = pool.submit(|| -> u8 { panic!("async boom") }).unwrap();

        assert_eq!(
            handle.await,
            Err(TaskError::Panicked("async boom".to_string()))
        );
    }
}
