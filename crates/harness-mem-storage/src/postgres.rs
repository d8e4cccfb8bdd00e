use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use harness_mem_core::{Row, SqlValue};

use crate::translate::translate_sql;
use crate::{AsyncStorageAdapter, BackendKind, StorageError};

/// The slice of a Postgres driver the adapter depends on. Statements reaching
/// this trait are already in the Postgres dialect.
#[async_trait]
pub trait PgClient: Send + Sync {
    async fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError>;

    /// Returns the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError>;

    async fn execute_batch(&self, sql: &str) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

/// Remote adapter. Only the asynchronous contract is implemented, so the
/// compiler rejects blocking use.
pub struct PostgresStorageAdapter {
    client: Arc<dyn PgClient>,
    closed: AtomicBool,
}

impl PostgresStorageAdapter {
    #[must_use]
    pub fn new(client: Arc<dyn PgClient>) -> Self {
        Self { client, closed: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl AsyncStorageAdapter for PostgresStorageAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn query_all_async(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, StorageError> {
        self.ensure_open()?;
        self.client.fetch(&translate_sql(sql), params).await
    }

    async fn query_one_async(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<Row>, StorageError> {
        self.ensure_open()?;
        let rows = self.client.fetch(&translate_sql(sql), params).await?;
        Ok(rows.into_iter().next())
    }

    async fn run_async(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError> {
        self.ensure_open()?;
        self.client.execute(&translate_sql(sql), params).await
    }

    async fn exec_async(&self, sql: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.client.execute_batch(sql).await
    }

    async fn transaction_async<T, F, Fut>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        self.ensure_open()?;
        self.client.execute("BEGIN", &[]).await?;
        match f().await {
            Ok(value) => {
                self.client.execute("COMMIT", &[]).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.client.execute("ROLLBACK", &[]).await {
                    tracing::warn!(
                        error = %rollback_err,
                        "rollback failed after transaction error"
                    );
                }
                Err(err)
            }
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.close().await
    }
}
