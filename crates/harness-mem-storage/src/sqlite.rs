use std::path::Path;

use harness_mem_core::{now_rfc3339, CoreError, Row, SqlValue};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};

use crate::{BackendKind, StorageAdapter, StorageError};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS mem_sessions (
  session_id TEXT PRIMARY KEY,
  platform TEXT NOT NULL,
  project TEXT NOT NULL,
  workspace_uid TEXT NOT NULL DEFAULT '',
  started_at TEXT NOT NULL,
  ended_at TEXT,
  summary TEXT,
  correlation_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mem_sessions_platform_project
  ON mem_sessions(platform, project, session_id, updated_at);

CREATE TABLE IF NOT EXISTS mem_events (
  event_id TEXT PRIMARY KEY,
  platform TEXT NOT NULL,
  project TEXT NOT NULL,
  workspace_uid TEXT NOT NULL DEFAULT '',
  session_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  ts TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  privacy_tags_json TEXT NOT NULL,
  dedupe_hash TEXT NOT NULL UNIQUE,
  observation_id TEXT,
  correlation_id TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY(session_id) REFERENCES mem_sessions(session_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_mem_events_lookup
  ON mem_events(platform, project, session_id, ts);

CREATE TABLE IF NOT EXISTS mem_observations (
  id TEXT PRIMARY KEY,
  event_id TEXT,
  platform TEXT NOT NULL,
  project TEXT NOT NULL,
  workspace_uid TEXT NOT NULL DEFAULT '',
  session_id TEXT NOT NULL,
  title TEXT,
  content TEXT NOT NULL,
  content_redacted TEXT NOT NULL,
  observation_type TEXT NOT NULL DEFAULT 'context',
  tags_json TEXT NOT NULL,
  privacy_tags_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY(event_id) REFERENCES mem_events(event_id) ON DELETE SET NULL,
  FOREIGN KEY(session_id) REFERENCES mem_sessions(session_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_mem_observations_lookup
  ON mem_observations(platform, project, session_id, created_at);

CREATE TABLE IF NOT EXISTS mem_tags (
  observation_id TEXT NOT NULL,
  tag TEXT NOT NULL,
  tag_type TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY(observation_id, tag, tag_type),
  FOREIGN KEY(observation_id) REFERENCES mem_observations(id) ON DELETE CASCADE
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS mem_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

/// Embedded primary store. Every call is a direct pass-through to `SQLite`.
pub struct SqliteStorageAdapter {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStorageAdapter {
    /// Open a `SQLite` database file and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns an error when pragmas cannot be applied.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, StorageError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(StorageError::Config(CoreError::Config(format!(
                "unsupported schema version {current}; expected at most {LATEST_SCHEMA_VERSION}"
            ))));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            record_schema_version(&tx, version)?;
            tx.commit()?;
            tracing::debug!(version, "applied local schema migration");
        }

        Ok(())
    }

    /// Read a value from `mem_meta`.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn meta_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row("SELECT value FROM mem_meta WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Upsert a value into `mem_meta`.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn meta_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let now = now_rfc3339()?;
        self.conn.execute(
            "INSERT INTO mem_meta(key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }
}

impl StorageAdapter for SqliteStorageAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query(params_from_iter(params.iter().map(Param)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode_row(&columns, row)?);
        }
        Ok(out)
    }

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StorageError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query(params_from_iter(params.iter().map(Param)))?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_row(&columns, row)?)),
            None => Ok(None),
        }
    }

    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StorageError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter().map(Param)))?)
    }

    fn exec(&self, sql: &str) -> Result<(), StorageError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Self) -> Result<T, StorageError>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    fn close(self) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_, err)| StorageError::Sqlite(err))
    }
}

struct Param<'a>(&'a SqlValue);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Bool(value) => ToSqlOutput::Owned(i64::from(*value).into()),
            SqlValue::Integer(value) => ToSqlOutput::Borrowed(ValueRef::Integer(*value)),
            SqlValue::Real(value) => ToSqlOutput::Borrowed(ValueRef::Real(*value)),
            SqlValue::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

fn decode_row(columns: &[String], row: &rusqlite::Row<'_>) -> Result<Row, StorageError> {
    let mut out = Row::new();
    for (idx, column) in columns.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(value) => SqlValue::Integer(value),
            ValueRef::Real(value) => SqlValue::Real(value),
            ValueRef::Text(bytes) => SqlValue::Text(
                String::from_utf8(bytes.to_vec()).map_err(|err| StorageError::Decode {
                    column: column.clone(),
                    message: err.to_string(),
                })?,
            ),
            ValueRef::Blob(bytes) => SqlValue::Text(hex::encode(bytes)),
        };
        out.insert(column.clone(), value);
    }
    Ok(out)
}

fn current_schema_version(conn: &Connection) -> Result<i64, StorageError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), StorageError> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )?;
    Ok(())
}
