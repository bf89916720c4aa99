use super::handle::{TaskError, TaskHandle};
use crate::metrics;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Number of workers a pool runs when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 5;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Starts an OS thread from a configured builder.
type Spawner =
    Arc<dyn Fn(thread::Builder, Job) -> std::io::Result<JoinHandle<()>> + Send + Sync>;

/// Errors raised synchronously by the pool itself, never by a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down and no longer accepts tasks")]
    Unavailable,

    #[error("Worker pool capacity must be at least 1")]
    InvalidCapacity,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

struct PoolState {
    backlog: VecDeque<Job>,
    accepting: bool,
    /// Workers blocked waiting for work.
    idle: usize,
    /// Tasks currently executing.
    running: usize,
    /// Workers that have not exited yet.
    live: usize,
    /// Workers ever spawned, used for thread names.
    spawned: usize,
    next_task_id: u64,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    name: Arc<str>,
    state: Mutex<PoolState>,
    work_available: Condvar,
    workers_exited: Condvar,
}

impl Shared {
    // No task ever runs while this lock is held, so a poisoned lock still
    // guards consistent state.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_load(&self, state: &PoolState) {
        metrics::set_pool_load(&self.name, state.backlog.len(), state.running);
    }
}

/// A fixed-capacity set of worker threads draining one FIFO backlog.
///
/// Workers are started lazily, one at a time, whenever the backlog holds more
/// tasks than there are idle workers and fewer than `capacity` workers exist.
/// Once started, a worker lives until [`WorkerPool::shutdown`].
///
/// The pool is meant to be built once by the application and passed around as
/// an `Arc<WorkerPool>`. Dropping the last reference shuts it down, which
/// blocks until every submitted task has finished.
pub struct WorkerPool {
    shared: Arc<Shared>,
    capacity: usize,
    spawner: Spawner,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` tasks at a time.
    ///
    /// No thread is started until the first submission.
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        Ok(Self::build(name.into(), capacity))
    }

    /// Create a pool with [`DEFAULT_CAPACITY`] workers.
    pub fn with_default_capacity(name: impl Into<String>) -> Self {
        Self::build(name.into(), DEFAULT_CAPACITY)
    }

    fn build(name: String, capacity: usize) -> Self {
        let spawner: Spawner =
            Arc::new(|builder: thread::Builder, body: Job| builder.spawn(body));
        Self::build_with_spawner(name, capacity, spawner)
    }

    fn build_with_spawner(name: String, capacity: usize, spawner: Spawner) -> Self {
        let name: Arc<str> = Arc::from(name);
        metrics::set_pool_workers(&name, 0);
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(PoolState {
                    backlog: VecDeque::new(),
                    accepting: true,
                    idle: 0,
                    running: 0,
                    live: 0,
                    spawned: 0,
                    next_task_id: 0,
                    workers: Vec::new(),
                }),
                work_available: Condvar::new(),
                workers_exited: Condvar::new(),
            }),
            capacity,
            spawner,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live worker threads, never more than `capacity`.
    pub fn worker_count(&self) -> usize {
        self.shared.lock().live
    }

    /// Tasks waiting in the backlog.
    pub fn queued(&self) -> usize {
        self.shared.lock().backlog.len()
    }

    /// Tasks currently executing on a worker.
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.lock().accepting
    }

    /// Queue `task` for execution and return a handle to its outcome.
    ///
    /// Never waits for a free worker. A panic inside `task` is captured on the
    /// returned handle as [`TaskError::Panicked`] and leaves the pool intact.
    ///
    /// Fails with [`PoolError::Unavailable`] once the pool has been shut down.
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let mut state = self.shared.lock();
        if !state.accepting {
            return Err(PoolError::Unavailable);
        }

        let task_id = state.next_task_id;

        let pool_name = Arc::clone(&self.shared.name);
        let finished_flag = Arc::clone(&finished);
        let job: Job = Box::new(move || {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| TaskError::Panicked(panic_message(&*payload)));

            let outcome_label = match &outcome {
                Ok(_) => "success",
                Err(e) => {
                    debug!("Task {} on pool '{}' failed: {}", task_id, pool_name, e);
                    "panic"
                }
            };
            metrics::record_task_finished(&pool_name, outcome_label, started.elapsed());

            // With the handle gone the outcome is dropped right here, and its
            // destructor may panic too.
            let delivery = panic::catch_unwind(AssertUnwindSafe(move || {
                let _ = result_tx.send(outcome);
            }));
            finished_flag.store(true, Ordering::Release);
            if let Err(payload) = delivery {
                debug!(
                    "Dropping the unclaimed result of task {} on pool '{}' panicked: {}",
                    task_id,
                    pool_name,
                    panic_message(&*payload)
                );
            }
        });

        state.backlog.push_back(job);

        if state.backlog.len() > state.idle && state.live < self.capacity {
            if let Err(e) = self.spawn_worker(&mut state) {
                if state.live == 0 {
                    // Nobody would ever run it.
                    state.backlog.pop_back();
                    self.shared.publish_load(&state);
                    return Err(PoolError::Spawn(e.to_string()));
                }
                warn!(
                    "Pool '{}' could not grow past {} workers: {}",
                    self.shared.name, state.live, e
                );
            }
        }
        state.next_task_id += 1;
        metrics::record_task_submitted(&self.shared.name);
        self.shared.publish_load(&state);
        drop(state);

        self.shared.work_available.notify_one();
        Ok(TaskHandle::new(task_id, result_rx, finished))
    }

    fn spawn_worker(&self, state: &mut PoolState) -> std::io::Result<()> {
        let index = state.spawned;
        let shared = Arc::clone(&self.shared);
        let builder =
            thread::Builder::new().name(format!("{}-worker-{}", self.shared.name, index));
        let handle = (self.spawner)(builder, Box::new(move || worker_loop(shared)))?;

        state.spawned += 1;
        state.live += 1;
        state.workers.push(handle);
        metrics::set_pool_workers(&self.shared.name, state.live);
        debug!(
            "Pool '{}' started worker {} ({}/{})",
            self.shared.name, index, state.live, self.capacity
        );
        Ok(())
    }

    /// Stop accepting tasks, wait for every queued and running task to finish,
    /// then join all workers.
    ///
    /// Safe to call more than once and from several threads; every call
    /// returns only after the pool is fully drained. When called from one of
    /// the pool's own tasks it stops intake but cannot wait for itself.
    pub fn shutdown(&self) {
        let (workers, first_call) = {
            let mut state = self.shared.lock();
            let first_call = state.accepting;
            if first_call {
                info!(
                    "Shutting down worker pool '{}' ({} queued, {} running)",
                    self.shared.name,
                    state.backlog.len(),
                    state.running
                );
            }
            state.accepting = false;
            (std::mem::take(&mut state.workers), first_call)
        };
        self.shared.work_available.notify_all();

        let current = thread::current().id();
        let mut inside_worker = false;
        for worker in workers {
            if worker.thread().id() == current {
                inside_worker = true;
                continue;
            }
            let worker_name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!("Worker {} exited abnormally", worker_name);
            }
        }
        if inside_worker {
            warn!(
                "Pool '{}' shut down from one of its own tasks, not waiting for drain",
                self.shared.name
            );
            return;
        }

        let mut state = self.shared.lock();
        while state.live > 0 {
            state = self
                .shared
                .workers_exited
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        if first_call {
            info!("Worker pool '{}' drained and stopped", self.shared.name);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("capacity", &self.capacity)
            .field("workers", &state.live)
            .field("queued", &state.backlog.len())
            .field("running", &state.running)
            .field("accepting", &state.accepting)
            .finish()
    }
}

/// Accounts for a worker leaving the pool, including by unwinding.
struct LiveWorker<'a> {
    shared: &'a Shared,
}

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.live -= 1;
        metrics::set_pool_workers(&self.shared.name, state.live);
        if state.live == 0 {
            self.shared.workers_exited.notify_all();
        }
        debug!(
            "Worker {} exiting",
            thread::current().name().unwrap_or("<unnamed>")
        );
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let _live = LiveWorker { shared: &shared };
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if let Some(job) = state.backlog.pop_front() {
                    state.running += 1;
                    shared.publish_load(&state);
                    break Some(job);
                }
                if !state.accepting {
                    break None;
                }
                state.idle += 1;
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                state.idle -= 1;
            }
        };

        let Some(job) = job else {
            break;
        };
        job();

        let mut state = shared.lock();
        state.running -= 1;
        shared.publish_load(&state);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
