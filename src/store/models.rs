use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// Format SQLite uses for `CURRENT_TIMESTAMP`, always UTC.
pub const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_sqlite_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, SQLITE_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_sqlite_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(SQLITE_TIMESTAMP_FORMAT).to_string()
}

/// A recorded synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncHistoryEntry {
    pub id: i64,
    /// `None` only for rows written with an explicit NULL timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    pub status: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}
