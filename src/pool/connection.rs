use crate::command::Command;
use crate::config::PoolKey;
use crate::error::PqMiddlewareError;
use crate::native::{NativeConnection, NativeDriver, ResultChunk};
use crate::reader::ResultStream;
use crate::transaction::{self, IsolationLevel, Transaction};
use crate::types::RowValues;

use super::ConnectionPool;

/// A connection checked out of a [`ConnectionPool`].
///
/// [`PooledConnection::close`] hands it back. Dropping it instead releases it
/// from a spawned task when a tokio runtime is available, and drops the
/// physical connection otherwise.
pub struct PooledConnection<D: NativeDriver> {
    pool: ConnectionPool<D>,
    key: PoolKey,
    conn: Option<D::Conn>,
}

impl<D: NativeDriver> std::fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("open", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: NativeDriver> PooledConnection<D> {
    pub(crate) fn new(pool: ConnectionPool<D>, key: PoolKey, conn: D::Conn) -> Self {
        Self {
            pool,
            key,
            conn: Some(conn),
        }
    }

    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` after close.
    pub fn native(&self) -> Result<&D::Conn, PqMiddlewareError> {
        self.conn
            .as_ref()
            .ok_or_else(|| PqMiddlewareError::InvalidOperation("connection is closed".into()))
    }

    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` after close.
    pub fn native_mut(&mut self) -> Result<&mut D::Conn, PqMiddlewareError> {
        self.conn
            .as_mut()
            .ok_or_else(|| PqMiddlewareError::InvalidOperation("connection is closed".into()))
    }

    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` after close.
    pub fn cancel_handle(
        &self,
    ) -> Result<<D::Conn as NativeConnection>::Cancel, PqMiddlewareError> {
        Ok(self.native()?.cancel_handle())
    }

    /// Give the connection back to its pool.
    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&self.key, conn).await;
        }
    }

    /// # Errors
    /// See [`Command::execute_reader`].
    pub async fn execute_reader(
        &mut self,
        cmd: &mut Command,
    ) -> Result<ResultStream<'_, D::Conn>, PqMiddlewareError> {
        cmd.execute_reader(self.native_mut()?).await
    }

    /// # Errors
    /// See [`Command::execute_non_query`].
    pub async fn execute_non_query(&mut self, cmd: &mut Command) -> Result<u64, PqMiddlewareError> {
        cmd.execute_non_query(self.native_mut()?).await
    }

    /// # Errors
    /// See [`Command::execute_scalar`].
    pub async fn execute_scalar(
        &mut self,
        cmd: &mut Command,
    ) -> Result<Option<RowValues>, PqMiddlewareError> {
        cmd.execute_scalar(self.native_mut()?).await
    }

    /// Run parameterless SQL as one round trip. Returns the last result; the
    /// first error wins.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::QueryError` when any statement fails.
    pub async fn execute_batch(&mut self, sql: &str) -> Result<ResultChunk, PqMiddlewareError> {
        let chunk = self.native_mut()?.exec(sql).await;
        if chunk.status.is_error() {
            let diagnostics = chunk.diagnostics.unwrap_or_else(|| {
                crate::error::Diagnostics::new("XX000", format!("batch failed: {sql}"))
            });
            return Err(PqMiddlewareError::QueryError(diagnostics));
        }
        Ok(chunk)
    }

    /// # Errors
    /// See [`transaction::begin`].
    pub async fn begin(
        &mut self,
        level: IsolationLevel,
    ) -> Result<Transaction<'_, D::Conn>, PqMiddlewareError> {
        transaction::begin(self.native_mut()?, level).await
    }
}

impl<D: NativeDriver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            let key = self.key.clone();
            handle.spawn(async move {
                pool.release(&key, conn).await;
            });
        } else {
            tracing::debug!(key = %self.key, "dropped outside a runtime; connection not reused");
        }
    }
}
