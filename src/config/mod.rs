mod file_config;

pub use file_config::FileConfig;

use crate::tasks::DEFAULT_CAPACITY;
use anyhow::{bail, Result};
use std::path::PathBuf;

pub const DEFAULT_POOL_NAME: &str = "tasks";
pub const DEFAULT_HISTORY_RETENTION_DAYS: u64 = 30;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub task_workers: usize,
    pub pool_name: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            task_workers: DEFAULT_CAPACITY,
            pool_name: DEFAULT_POOL_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub task_workers: usize,
    pub pool_name: String,
    pub history_retention_days: u64,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db or in config file")
            })?;

        // The database file may not exist yet, its directory must
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let task_workers = file.task_workers.unwrap_or(cli.task_workers);
        if task_workers == 0 {
            bail!("task_workers must be at least 1");
        }

        let pool_name = file.pool_name.unwrap_or_else(|| cli.pool_name.clone());
        if pool_name.trim().is_empty() {
            bail!("pool_name must not be empty");
        }

        let history_retention_days = file
            .history_retention_days
            .unwrap_or(DEFAULT_HISTORY_RETENTION_DAYS);

        Ok(Self {
            db_path,
            task_workers,
            pool_name,
            history_retention_days,
        })
    }
}
