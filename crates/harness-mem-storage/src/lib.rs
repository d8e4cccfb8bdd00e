use std::fmt::{Display, Formatter};
use std::future::Future;

use async_trait::async_trait;
use harness_mem_core::{CoreError, Row, SqlValue};
use serde::{Deserialize, Serialize};

mod factory;
mod postgres;
mod schema;
mod sqlite;
mod sqlx_client;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod translate;

pub use factory::{create_storage_adapter, AdapterFactoryResult, RemoteTarget};
pub use postgres::{PgClient, PostgresStorageAdapter};
pub use schema::POSTGRES_INIT_SQL;
pub use sqlite::{SchemaStatus, SqliteStorageAdapter};
pub use sqlx_client::SqlxPgClient;
pub use translate::{rewrite_params, translate_sql};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("remote database error: {0}")]
    Remote(String),
    #[error("failed to decode column {column}: {message}")]
    Decode { column: String, message: String },
    #[error(transparent)]
    Config(#[from] CoreError),
    #[error("storage adapter is closed")]
    Closed,
}

/// Which engine sits behind an adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

mod private {
    pub trait Sealed {}

    impl Sealed for super::SqliteStorageAdapter {}
    impl Sealed for super::PostgresStorageAdapter {}
}

/// Synchronous storage contract. Only the embedded engine implements it, so a
/// remote adapter can never be driven from a blocking call site.
pub trait StorageAdapter: private::Sealed {
    fn backend(&self) -> BackendKind;

    /// # Errors
    /// Returns an error when the statement cannot be prepared or executed.
    fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError>;

    /// # Errors
    /// Returns an error when the statement cannot be prepared or executed.
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StorageError>;

    /// Execute a statement and return the number of affected rows.
    ///
    /// # Errors
    /// Returns an error when the statement cannot be prepared or executed.
    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StorageError>;

    /// Execute one or more parameterless statements (DDL).
    ///
    /// # Errors
    /// Returns an error when any statement fails.
    fn exec(&self, sql: &str) -> Result<(), StorageError>;

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// # Errors
    /// Returns the error produced by `f` or by the commit.
    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        Self: Sized,
        F: FnOnce(&Self) -> Result<T, StorageError>;

    /// # Errors
    /// Returns an error when the underlying handle refuses to close.
    fn close(self) -> Result<(), StorageError>
    where
        Self: Sized;

    fn query<'a>(&'a self, sql: &'a str) -> Query<'a, Self>
    where
        Self: Sized,
    {
        Query { adapter: self, sql }
    }
}

/// A statement bound to an adapter, executed with `all`, `get` or `run`.
pub struct Query<'a, A> {
    adapter: &'a A,
    sql: &'a str,
}

impl<A: StorageAdapter> Query<'_, A> {
    /// # Errors
    /// Propagates the adapter error.
    pub fn all(&self, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        self.adapter.query_all(self.sql, params)
    }

    /// # Errors
    /// Propagates the adapter error.
    pub fn get(&self, params: &[SqlValue]) -> Result<Option<Row>, StorageError> {
        self.adapter.query_one(self.sql, params)
    }

    /// # Errors
    /// Propagates the adapter error.
    pub fn run(&self, params: &[SqlValue]) -> Result<usize, StorageError> {
        self.adapter.run(self.sql, params)
    }
}

/// Asynchronous storage contract for networked engines. Statements are written
/// in the portable dialect (`?` placeholders, `INSERT OR IGNORE`) and translated
/// by the implementation.
#[async_trait]
pub trait AsyncStorageAdapter: private::Sealed + Send + Sync {
    fn backend(&self) -> BackendKind;

    /// # Errors
    /// Returns an error when the remote query fails or the adapter is closed.
    async fn query_all_async(&self, sql: &str, params: &[SqlValue])
        -> Result<Vec<Row>, StorageError>;

    /// # Errors
    /// Returns an error when the remote query fails or the adapter is closed.
    async fn query_one_async(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<Row>, StorageError>;

    /// # Errors
    /// Returns an error when the remote statement fails or the adapter is closed.
    async fn run_async(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError>;

    /// Execute a raw batch without dialect translation.
    ///
    /// # Errors
    /// Returns an error when the remote batch fails or the adapter is closed.
    async fn exec_async(&self, sql: &str) -> Result<(), StorageError>;

    /// Wrap `f` in `BEGIN`/`COMMIT`, issuing `ROLLBACK` when it fails.
    ///
    /// # Errors
    /// Returns the error produced by `f` or by the transaction statements.
    async fn transaction_async<T, F, Fut>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send;

    /// Release the connection. Safe to call more than once.
    ///
    /// # Errors
    /// Returns an error when the driver fails to close the connection.
    async fn close(&self) -> Result<(), StorageError>;
}
