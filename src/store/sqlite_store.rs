use super::models::{format_sqlite_timestamp, parse_sqlite_timestamp, SyncHistoryEntry, User};
use super::schema::{APP_VERSIONED_SCHEMAS, SYNC_STATUS_MAX_LEN};
use super::{SyncHistoryStore, UserStore};
use crate::sqlite_persistence::{VersionedSchema, BASE_DB_VERSION};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

fn latest_schema() -> &'static VersionedSchema {
    &APP_VERSIONED_SCHEMAS[APP_VERSIONED_SCHEMAS.len() - 1]
}

fn schema_for_version(version: usize) -> Result<&'static VersionedSchema> {
    APP_VERSIONED_SCHEMAS
        .iter()
        .find(|s| s.version == version)
        .ok_or_else(|| anyhow!("Unknown database version {}", version))
}

fn is_blank_database(conn: &Connection) -> Result<bool> {
    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let object_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?;
    Ok(raw_version == 0 && object_count == 0)
}

fn read_version(conn: &Connection) -> Result<usize> {
    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 1 {
        bail!("Database version {} is invalid (expected >= 1)", db_version);
    }
    Ok(db_version as usize)
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at `db_path`, creating it at the latest version if
    /// the file does not exist and upgrading it otherwise.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let (mut conn, db_version) = Self::open_and_validate(db_path.as_ref())?;

        let latest_version = latest_schema().version;
        if db_version < latest_version {
            info!(
                "Migrating database from version {} to {}",
                db_version, latest_version
            );
            Self::migrate_if_needed(&mut conn, db_version)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database without upgrading it. A missing file is still
    /// created at the latest version.
    pub fn open_unmigrated<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let (conn, _) = Self::open_and_validate(db_path.as_ref())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn open_and_validate(path: &Path) -> Result<(Connection, usize)> {
        let file_existed = path.exists();

        let conn = Connection::open(path).context("Failed to open database")?;

        // A zero-length file opens as an empty, unversioned database
        if !file_existed || is_blank_database(&conn)? {
            info!("Creating new database at {:?}", path);
            let schema = latest_schema();
            schema.create(&conn)?;
            return Ok((conn, schema.version));
        }

        let db_version = read_version(&conn)?;
        let latest_version = latest_schema().version;
        if db_version > latest_version {
            bail!(
                "Database version {} is newer than the latest known version {}",
                db_version,
                latest_version
            );
        }

        schema_for_version(db_version)?
            .validate(&conn)
            .with_context(|| {
                format!("Database schema validation failed for version {}", db_version)
            })?;

        Ok((conn, db_version))
    }

    fn migrate_if_needed(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in APP_VERSIONED_SCHEMAS.iter().skip(from_version) {
            if schema.version > from_version {
                info!(
                    "Running database migration from version {} to {}",
                    latest_from, schema.version
                );
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx).with_context(|| {
                        format!("Failed to run migration to version {}", schema.version)
                    })?;
                }
                latest_from = schema.version;
            }
        }
        latest_schema().validate(&tx).with_context(|| {
            format!(
                "Schema validation failed after migrating to version {}",
                latest_from
            )
        })?;
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    pub fn current_version(&self) -> Result<usize> {
        let conn = self.conn()?;
        read_version(&conn)
    }

    /// Move the database to `target`, upgrading or downgrading one version at
    /// a time. Either every step applies or none does.
    pub fn migrate_to(&self, target: usize) -> Result<()> {
        let target_schema = schema_for_version(target)?;
        let mut conn = self.conn()?;
        let current = read_version(&conn)?;
        if current == target {
            info!("Database already at version {}", target);
            return Ok(());
        }

        let tx = conn.transaction()?;
        if target > current {
            for schema in APP_VERSIONED_SCHEMAS
                .iter()
                .filter(|s| s.version > current && s.version <= target)
            {
                info!(
                    "Upgrading database from version {} to {}",
                    schema.version - 1,
                    schema.version
                );
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx).with_context(|| {
                        format!("Failed to run migration to version {}", schema.version)
                    })?;
                }
            }
        } else {
            for schema in APP_VERSIONED_SCHEMAS
                .iter()
                .rev()
                .filter(|s| s.version > target && s.version <= current)
            {
                info!(
                    "Downgrading database from version {} to {}",
                    schema.version,
                    schema.version - 1
                );
                let rollback_fn = schema.rollback.with_context(|| {
                    format!("Version {} has no downgrade step", schema.version)
                })?;
                rollback_fn(&tx).with_context(|| {
                    format!("Failed to roll back version {}", schema.version)
                })?;
            }
        }

        target_schema
            .validate(&tx)
            .with_context(|| format!("Schema validation failed after moving to version {}", target))?;
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn row_to_sync_entry(row: &rusqlite::Row) -> rusqlite::Result<SyncHistoryEntry> {
        let timestamp_str: Option<String> = row.get("timestamp")?;
        let data_str: Option<String> = row.get("data")?;
        let data = data_str
            .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

        Ok(SyncHistoryEntry {
            id: row.get("id")?,
            timestamp: timestamp_str.as_deref().and_then(parse_sqlite_timestamp),
            status: row.get("status")?,
            data,
        })
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let created_at_str: Option<String> = row.get("created_at")?;

        Ok(User {
            id: row.get("id")?,
            username: row.get("username")?,
            email: row.get("email")?,
            created_at: created_at_str.as_deref().and_then(parse_sqlite_timestamp),
            is_active: row.get("is_active")?,
        })
    }
}

impl SyncHistoryStore for SqliteStore {
    fn record_sync(&self, status: &str, data: Option<&serde_json::Value>) -> Result<i64> {
        if status.trim().is_empty() {
            bail!("Sync status must not be empty");
        }
        if status.chars().count() > SYNC_STATUS_MAX_LEN {
            bail!(
                "Sync status '{}' is longer than {} characters",
                status,
                SYNC_STATUS_MAX_LEN
            );
        }
        let data_json = data.map(serde_json::to_string).transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_history (status, data) VALUES (?1, ?2)",
            params![status, data_json],
        )
        .context("Failed to record sync history")?;

        Ok(conn.last_insert_rowid())
    }

    fn get_recent_syncs(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, status, data FROM sync_history
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let entries = stmt
            .query_map(params![limit as i64], Self::row_to_sync_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    fn count_syncs(&self, status: Option<&str>) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_history WHERE ?1 IS NULL OR status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn prune_syncs_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM sync_history WHERE timestamp < ?1",
            params![format_sqlite_timestamp(&cutoff)],
        )?;
        Ok(deleted)
    }
}

impl UserStore for SqliteStore {
    fn add_user(&self, username: &str, email: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, email) VALUES (?1, ?2)",
            params![username, email],
        )
        .with_context(|| format!("Failed to add user {}", username))?;
        Ok(conn.last_insert_rowid())
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, username, email, created_at, is_active FROM users WHERE username = ?1",
                params![username],
                Self::row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    fn set_user_active(&self, user_id: i64, active: bool) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![active, user_id],
        )?;
        if updated == 0 {
            bail!("User {} not found", user_id);
        }
        Ok(())
    }

    fn list_active_users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, email, created_at, is_active FROM users
             WHERE is_active = 1 ORDER BY id",
        )?;

        let users = stmt
            .query_map([], Self::row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(users)
    }
}
