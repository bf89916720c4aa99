//! SQLite schema definitions for the application database.
//!
//! Version 1 holds the pre-existing `users` table. Later versions add the
//! sync history table and the users' active flag, each with an upgrade and a
//! downgrade step.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};
use anyhow::Result;
use rusqlite::Connection;

/// Longest status string the history table is declared to hold.
pub const SYNC_STATUS_MAX_LEN: usize = 20;

// =============================================================================
// Version 1 - Users
// =============================================================================

const USERS_TABLE_V1: Table = Table {
    name: "users",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("username", SqlType::Varchar(64), non_null = true),
        sqlite_column!("email", SqlType::Varchar(120), non_null = true),
        sqlite_column!(
            "created_at",
            SqlType::DateTime,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[&["username"], &["email"]],
};

// =============================================================================
// Version 2 - Sync history
// =============================================================================

/// One row per synchronization run; `data` holds the run's JSON payload.
const SYNC_HISTORY_TABLE_V2: Table = Table {
    name: "sync_history",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "timestamp",
            SqlType::DateTime,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("status", SqlType::Varchar(SYNC_STATUS_MAX_LEN), non_null = true),
        sqlite_column!("data", SqlType::Text),
    ],
    unique_constraints: &[],
};

fn create_sync_history_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE sync_history (
            id INTEGER PRIMARY KEY,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            status VARCHAR(20) NOT NULL,
            data TEXT
        )",
        [],
    )?;
    Ok(())
}

fn drop_sync_history_table(conn: &Connection) -> Result<()> {
    conn.execute("DROP TABLE sync_history", [])?;
    Ok(())
}

// =============================================================================
// Version 3 - Users active flag
// =============================================================================

const USERS_TABLE_V3: Table = Table {
    name: "users",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("username", SqlType::Varchar(64), non_null = true),
        sqlite_column!("email", SqlType::Varchar(120), non_null = true),
        sqlite_column!(
            "created_at",
            SqlType::DateTime,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "is_active",
            SqlType::Boolean,
            non_null = true,
            default_value = Some("1")
        ),
    ],
    unique_constraints: &[&["username"], &["email"]],
};

/// Existing users become active through the column default.
fn add_users_active_flag(conn: &Connection) -> Result<()> {
    conn.execute(
        "ALTER TABLE users ADD COLUMN is_active BOOLEAN NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

fn drop_users_active_flag(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE users DROP COLUMN is_active", [])?;
    Ok(())
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// All versioned schemas for the application database.
///
/// Version 1: Users table
/// Version 2: Sync history table
/// Version 3: `users.is_active` flag
pub const APP_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[USERS_TABLE_V1],
        migration: None,
        rollback: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[USERS_TABLE_V1, SYNC_HISTORY_TABLE_V2],
        migration: Some(create_sync_history_table),
        rollback: Some(drop_sync_history_table),
    },
    VersionedSchema {
        version: 3,
        tables: &[USERS_TABLE_V3, SYNC_HISTORY_TABLE_V2],
        migration: Some(add_users_active_flag),
        rollback: Some(drop_users_active_flag),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn test_every_version_creates_and_validates() {
        for schema in APP_VERSIONED_SCHEMAS {
            let conn = Connection::open_in_memory().unwrap();
            schema.create(&conn).unwrap();
            schema.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_versions_are_sequential() {
        for (index, schema) in APP_VERSIONED_SCHEMAS.iter().enumerate() {
            assert_eq!(schema.version, index + 1);
            assert_eq!(schema.migration.is_some(), index > 0);
            assert_eq!(schema.rollback.is_some(), index > 0);
        }
    }

    #[test]
    fn test_each_migration_produces_next_schema() {
        let conn = Connection::open_in_memory().unwrap();
        APP_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        for schema in APP_VERSIONED_SCHEMAS.iter().skip(1) {
            (schema.migration.unwrap())(&conn).unwrap();
            schema.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_each_rollback_restores_previous_schema() {
        let conn = Connection::open_in_memory().unwrap();
        APP_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();

        for pair in APP_VERSIONED_SCHEMAS.windows(2).rev() {
            let (previous, current) = (&pair[0], &pair[1]);
            (current.rollback.unwrap())(&conn).unwrap();
            previous.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_sync_history_defaults() {
        let conn = Connection::open_in_memory().unwrap();
        APP_VERSIONED_SCHEMAS[1].create(&conn).unwrap();

        conn.execute(
            "INSERT INTO sync_history (status) VALUES (?1)",
            params!["completed"],
        )
        .unwrap();

        let (timestamp, data): (Option<String>, Option<String>) = conn
            .query_row("SELECT timestamp, data FROM sync_history", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert!(timestamp.is_some());
        assert!(data.is_none());
    }

    #[test]
    fn test_sync_history_requires_status() {
        let conn = Connection::open_in_memory().unwrap();
        APP_VERSIONED_SCHEMAS[1].create(&conn).unwrap();

        let result = conn.execute("INSERT INTO sync_history (data) VALUES ('{}')", []);
        assert!(result.is_err());
    }

    #[test]
    fn test_active_flag_defaults_existing_users_to_true() {
        let conn = Connection::open_in_memory().unwrap();
        APP_VERSIONED_SCHEMAS[1].create(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (username, email) VALUES (?1, ?2)",
            params!["alice", "alice@example.com"],
        )
        .unwrap();

        add_users_active_flag(&conn).unwrap();

        let is_active: bool = conn
            .query_row(
                "SELECT is_active FROM users WHERE username = 'alice'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(is_active);
    }
}
