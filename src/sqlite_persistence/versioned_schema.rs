use anyhow::{bail, Context, Result};
use rusqlite::{params, types::Type, Connection};

pub const DEFAULT_TIMESTAMP: &str = "CURRENT_TIMESTAMP";

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Only mutated when optional fields are given
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                is_unique: false,
                default_value: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

/// Declared column type.
///
/// SQLite keeps the declared type verbatim, so `Varchar(20)` round-trips
/// through `PRAGMA table_info` as `VARCHAR(20)` even though the length is not
/// enforced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
    Boolean,
    DateTime,
    Varchar(usize),
}

impl SqlType {
    pub fn declaration(&self) -> String {
        match self {
            SqlType::Text => "TEXT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::DateTime => "DATETIME".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR({})", len),
        }
    }

    pub fn parse(declared: &str) -> Option<Self> {
        let declared = declared.trim().to_ascii_uppercase();
        match declared.as_str() {
            "TEXT" => Some(SqlType::Text),
            "INTEGER" => Some(SqlType::Integer),
            "REAL" => Some(SqlType::Real),
            "BLOB" => Some(SqlType::Blob),
            "BOOLEAN" => Some(SqlType::Boolean),
            "DATETIME" => Some(SqlType::DateTime),
            other => other
                .strip_prefix("VARCHAR(")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|len| len.trim().parse().ok())
                .map(SqlType::Varchar),
        }
    }
}

pub struct Column<S: AsRef<str>> {
    pub name: S,
    pub sql_type: SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub is_unique: bool,
    pub default_value: Option<S>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column<&'static str>],
    pub unique_constraints: &'static [&'static [&'static str]],
}

impl Column<&'static str> {
    /// Column definition as it appears inside `CREATE TABLE`.
    fn definition(&self) -> String {
        let mut definition = format!("{} {}", self.name, self.sql_type.declaration());
        if self.is_primary_key {
            definition.push_str(" PRIMARY KEY");
        }
        if self.non_null {
            definition.push_str(" NOT NULL");
        }
        if self.is_unique {
            definition.push_str(" UNIQUE");
        }
        if let Some(default_value) = self.default_value {
            definition.push_str(" DEFAULT ");
            definition.push_str(default_value);
        }
        definition
    }
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let definitions: Vec<String> = self
            .columns
            .iter()
            .map(Column::definition)
            .chain(
                self.unique_constraints
                    .iter()
                    .map(|columns| format!("UNIQUE ({})", columns.join(", "))),
            )
            .collect();

        let create_sql = format!("CREATE TABLE {} ({});", self.name, definitions.join(", "));
        conn.execute(&create_sql, params![])
            .with_context(|| format!("Failed to create table {}", self.name))?;
        Ok(())
    }
}

/// One version of a database layout.
///
/// `migration` upgrades a database from the previous version to this one,
/// `rollback` takes it from this version back to the previous one. Both are
/// `None` for the first version.
pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
    pub rollback: Option<fn(&Connection) -> Result<()>>,
}

/// SQLite may report a default wrapped in parentheses.
fn normalize_default(value: &str) -> &str {
    value
        .strip_prefix('(')
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(value)
}

/// Columns of `table` as SQLite reports them, in declaration order.
fn read_columns(conn: &Connection, table: &str) -> Result<Vec<Column<String>>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table))?;
    let columns = stmt
        .query_map(params![], |row| {
            let declared: String = row.get(2)?;
            let sql_type = SqlType::parse(&declared)
                .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, declared, Type::Text))?;
            Ok(Column {
                name: row.get(1)?,
                sql_type,
                non_null: row.get::<_, i32>(3)? == 1,
                default_value: row.get(4)?,
                is_primary_key: row.get::<_, i32>(5)? == 1,
                is_unique: false,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Failed to read columns of table {}", table))?;
    Ok(columns)
}

/// Column sets covered by a unique index on `table`, each sorted.
fn read_unique_column_sets(conn: &Connection, table: &str) -> Result<Vec<Vec<String>>> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", table))?;
    let unique_indices = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i32>(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut sets = Vec::new();
    for (index_name, _) in unique_indices.into_iter().filter(|(_, unique)| *unique == 1) {
        let mut idx_stmt = conn.prepare(&format!("PRAGMA index_info({})", index_name))?;
        let mut columns = idx_stmt
            .query_map([], |row| row.get::<_, String>(2))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        columns.sort();
        sets.push(columns);
    }
    Ok(sets)
}

fn check_column(table: &str, actual: &Column<String>, expected: &Column<&str>) -> Result<()> {
    if actual.name != expected.name {
        bail!(
            "Table {} Column name mismatch: expected {}, got {}",
            table,
            expected.name,
            actual.name
        );
    }
    if actual.sql_type != expected.sql_type {
        bail!(
            "Table {} Column {} type mismatch: expected {}, got {}",
            table,
            expected.name,
            expected.sql_type.declaration(),
            actual.sql_type.declaration()
        );
    }
    if actual.non_null != expected.non_null {
        bail!(
            "Table {} Column {} non-null mismatch: expected {}, got {}",
            table,
            expected.name,
            expected.non_null,
            actual.non_null
        );
    }
    if actual.default_value.as_deref().map(normalize_default)
        != expected.default_value.map(normalize_default)
    {
        bail!(
            "Table {} Column {} default value mismatch: expected {:?}, got {:?}",
            table,
            expected.name,
            expected.default_value,
            actual.default_value
        );
    }
    if actual.is_primary_key != expected.is_primary_key {
        bail!(
            "Table {} Column {} primary key mismatch: expected {}, got {}",
            table,
            expected.name,
            expected.is_primary_key,
            actual.is_primary_key
        );
    }
    Ok(())
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    /// Check that every table of this version exists in `conn` with exactly
    /// the declared columns and unique constraints.
    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            let actual_columns = read_columns(conn, table.name)?;
            if actual_columns.is_empty() {
                bail!("Table {} does not exist", table.name);
            }

            if actual_columns.len() != table.columns.len() {
                let found: Vec<&str> = actual_columns.iter().map(|c| c.name.as_str()).collect();
                let expected: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
                bail!(
                    "Table {} has {} columns, expected {}. Found column names: {}, expected: {}",
                    table.name,
                    found.len(),
                    expected.len(),
                    found.join(", "),
                    expected.join(", ")
                );
            }

            for (actual, expected) in actual_columns.iter().zip(table.columns) {
                check_column(table.name, actual, expected)?;
            }

            if table.unique_constraints.is_empty() {
                continue;
            }
            let unique_sets = read_unique_column_sets(conn, table.name)?;
            for constraint in table.unique_constraints {
                let mut wanted = constraint.to_vec();
                wanted.sort();
                let covered = unique_sets
                    .iter()
                    .any(|set| set.iter().map(String::as_str).eq(wanted.iter().copied()));
                if !covered {
                    bail!(
                        "Table {} is missing unique constraint on columns ({})",
                        table.name,
                        constraint.join(", ")
                    );
                }
            }
        }
        Ok(())
    }
}

pub const BASE_DB_VERSION: usize = 99999;
