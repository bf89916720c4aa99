//! Common test infrastructure
//!
//! Fixtures for tests that need an on-disk database next to a worker pool.

mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{create_legacy_db, TestEnv};
