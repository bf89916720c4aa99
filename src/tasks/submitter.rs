use super::handle::TaskHandle;
use super::pool::{PoolError, WorkerPool};
use std::sync::Arc;

/// A unit of work bound to a pool: calling it queues the work instead of
/// running it.
///
/// Functions taking several arguments take them as a tuple, functions taking
/// none take `()`.
pub struct TaskSubmitter<F> {
    pool: Arc<WorkerPool>,
    task: Arc<F>,
}

impl<F> TaskSubmitter<F> {
    pub fn new(pool: Arc<WorkerPool>, task: F) -> Self {
        Self {
            pool,
            task: Arc::new(task),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Queue one invocation of the wrapped function with `args`.
    ///
    /// Returns as soon as the call is queued. Fails right away, without
    /// touching the function, if the pool has been shut down.
    pub fn submit<A, R>(&self, args: A) -> Result<TaskHandle<R>, PoolError>
    where
        F: Fn(A) -> R + Send + Sync + 'static,
        A: Send + 'static,
        R: Send + 'static,
    {
        let task = Arc::clone(&self.task);
        self.pool.submit(move || task(args))
    }
}

impl<F> Clone for TaskSubmitter<F> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            task: Arc::clone(&self.task),
        }
    }
}

/// Wrap `task` so that every call runs it on `pool` in the background.
///
/// ```no_run
/// use potsync_tasks::tasks::{background, WorkerPool};
/// use std::sync::Arc;
///
/// let pool = Arc::new(WorkerPool::with_default_capacity("tasks"));
/// let sync_account = background(Arc::clone(&pool), |account_id: u64| {
///     // talk to the bank...
///     account_id
/// });
///
/// let handle = sync_account(7).unwrap();
/// assert_eq!(handle.wait().unwrap(), 7);
/// pool.shutdown();
/// ```
pub fn background<A, R, F>(
    pool: Arc<WorkerPool>,
    task: F,
) -> impl Fn(A) -> Result<TaskHandle<R>, PoolError> + Clone + Send + Sync
where
    F: Fn(A) -> R + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    let submitter = TaskSubmitter::new(pool, task);
    move |args: A| submitter.submit(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_call_returns_before_function_runs() {
        let pool = Arc::new(WorkerPool::new("deferred", 1).unwrap());
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = std::sync::Mutex::new(gate_rx);
        let ran = Arc::new(AtomicBool::new(false));

        let ran_in_task = Arc::clone(&ran);
        let mark = background(Arc::clone(&pool), move |_: ()| {
            let _ = gate_rx.lock().unwrap().recv();
            ran_in_task.store(true, Ordering::SeqCst);
        });

        let handle = mark(()).unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!handle.is_finished());

        gate_tx.send(()).unwrap();
        handle.wait().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_function_does_not_run_on_caller_thread() {
        let pool = Arc::new(WorkerPool::new("affinity", 2).unwrap());
        let caller = thread::current().id();

        let where_am_i = background(pool, |_: ()| thread::current().id());
        let worker = where_am_i(()).unwrap().wait().unwrap();

        assert_ne!(worker, caller);
    }

    #[test]
    fn test_tuple_arguments_are_forwarded() {
        let pool = Arc::new(WorkerPool::new("tuple-args", 2).unwrap());
        let add = TaskSubmitter::new(pool, |(a, b): (i64, i64)| a + b);

        let handles: Vec<_> = (0..5).map(|i| add.submit((i, 10)).unwrap()).collect();
        let sums: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();

        assert_eq!(sums, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_submission_after_shutdown_fails_synchronously() {
        let pool = Arc::new(WorkerPool::new("wrapped-closed", 2).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in_task = Arc::clone(&calls);
        let count = background(Arc::clone(&pool), move |_: ()| {
            calls_in_task.fetch_add(1, Ordering::SeqCst);
        });

        count(()).unwrap();
        pool.shutdown();

        assert!(matches!(count(()), Err(PoolError::Unavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cloned_submitters_share_the_pool() {
        let pool = Arc::new(WorkerPool::new("cloned", 3).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_in_task = Arc::clone(&counter);
        let increment = background(Arc::clone(&pool), move |by: usize| {
            counter_in_task.fetch_add(by, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let increment = increment.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        increment(1).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_panicking_wrapped_function_is_captured() {
        let pool = Arc::new(WorkerPool::new("wrapped-panic", 1).unwrap());
        let parse = background(Arc::clone(&pool), |input: &'static str| {
            input.parse::<u32>().expect("not a number")
        });

        let bad = parse("abc").unwrap();
        let good = parse("12").unwrap();

        assert!(matches!(bad.wait(), Err(TaskError::Panicked(msg)) if msg.contains("not a number")));
        assert_eq!(good.wait().unwrap(), 12);
    }
}
