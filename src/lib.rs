//! Potsync background tasks library
//!
//! A fixed-size worker pool with a decorator that turns plain functions into
//! background submissions, plus the versioned SQLite schema and stores the
//! background work writes to.

pub mod config;
pub mod metrics;
pub mod sqlite_persistence;
pub mod store;
pub mod tasks;

// Re-export commonly used types for convenience
pub use store::{SqliteStore, SyncHistoryStore, UserStore};
pub use tasks::{background, PoolError, TaskError, TaskHandle, TaskSubmitter, WorkerPool};
