//! Background task execution.
//!
//! A [`WorkerPool`] runs submitted closures on a fixed number of worker
//! threads fed from a single FIFO backlog. [`background`] and
//! [`TaskSubmitter`] wrap a function so that calling it queues the call on a
//! pool and hands back a [`TaskHandle`] instead of running it in place.

mod handle;
mod pool;
mod submitter;

pub use handle::{TaskError, TaskHandle};
pub use pool::{PoolError, WorkerPool, DEFAULT_CAPACITY};
pub use submitter::{background, TaskSubmitter};
