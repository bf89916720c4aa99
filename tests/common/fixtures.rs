// Not every test binary uses every fixture
#![allow(dead_code)]

use anyhow::Result;
use potsync_tasks::store::APP_VERSIONED_SCHEMAS;
use potsync_tasks::{SqliteStore, WorkerPool};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A fresh database and a pool, both living as long as the value.
pub struct TestEnv {
    pub store: Arc<SqliteStore>,
    pub pool: Arc<WorkerPool>,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub fn new(pool_name: &str, workers: usize) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("app.db");
        let store = Arc::new(SqliteStore::new(&db_path)?);
        let pool = Arc::new(WorkerPool::new(pool_name, workers)?);
        Ok(Self {
            store,
            pool,
            db_path,
            _temp_dir: temp_dir,
        })
    }
}

/// Creates a version 1 database holding the given users and returns its
/// directory and path.
pub fn create_legacy_db(users: &[(&str, &str)]) -> Result<(TempDir, PathBuf)> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("legacy.db");

    let conn = Connection::open(&db_path)?;
    APP_VERSIONED_SCHEMAS[0].create(&conn)?;
    for (username, email) in users {
        conn.execute(
            "INSERT INTO users (username, email) VALUES (?1, ?2)",
            params![username, email],
        )?;
    }

    Ok((dir, db_path))
}
