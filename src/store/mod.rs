mod models;
mod schema;
mod sqlite_store;

pub use models::*;
pub use schema::{APP_VERSIONED_SCHEMAS, SYNC_STATUS_MAX_LEN};
pub use sqlite_store::SqliteStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait SyncHistoryStore: Send + Sync {
    /// Insert a history row and return its id. The timestamp is set by the
    /// database.
    fn record_sync(&self, status: &str, data: Option<&serde_json::Value>) -> Result<i64>;
    /// Most recent entries first.
    fn get_recent_syncs(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>>;
    /// Count all entries, or only those with the given status.
    fn count_syncs(&self, status: Option<&str>) -> Result<usize>;
    /// Delete entries older than `cutoff`. Returns the number deleted.
    fn prune_syncs_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub trait UserStore: Send + Sync {
    fn add_user(&self, username: &str, email: &str) -> Result<i64>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn set_user_active(&self, user_id: i64, active: bool) -> Result<()>;
    fn list_active_users(&self) -> Result<Vec<User>>;
}
