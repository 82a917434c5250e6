use crate::command::Command;
use crate::error::{Diagnostics, PqMiddlewareError};
use crate::native::{ExecStatus, NativeConnection, ResultChunk};
use crate::types::RowValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    ReadUncommitted,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
        }
    }
}

/// Open a transaction block on `conn`.
///
/// # Errors
/// Returns `PqMiddlewareError::QueryError` when the server rejects `BEGIN`.
pub async fn begin<C: NativeConnection>(
    conn: &mut C,
    level: IsolationLevel,
) -> Result<Transaction<'_, C>, PqMiddlewareError> {
    let sql = format!("BEGIN ISOLATION LEVEL {}", level.as_sql());
    expect_command_ok(conn, &sql).await?;
    tracing::debug!(isolation = level.as_sql(), "transaction started");
    Ok(Transaction { conn, level })
}

async fn expect_command_ok<C: NativeConnection>(
    conn: &mut C,
    sql: &str,
) -> Result<(), PqMiddlewareError> {
    let ResultChunk {
        status,
        diagnostics,
        ..
    } = conn.exec(sql).await;
    if status == ExecStatus::CommandOk {
        return Ok(());
    }
    Err(PqMiddlewareError::QueryError(diagnostics.unwrap_or_else(
        || Diagnostics::new("XX000", format!("{sql}: unexpected status {status:?}")),
    )))
}

/// An open transaction block. Dropping it without [`Transaction::commit`] or
/// [`Transaction::rollback`] leaves the block open; the pool rolls it back
/// when the connection is released.
pub struct Transaction<'c, C: NativeConnection> {
    conn: &'c mut C,
    level: IsolationLevel,
}

impl<C: NativeConnection> std::fmt::Debug for Transaction<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl<C: NativeConnection> Transaction<'_, C> {
    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    /// The connection, for running commands inside the block.
    pub fn conn(&mut self) -> &mut C {
        self.conn
    }

    /// # Errors
    /// Same as [`Command::execute_non_query`].
    pub async fn execute_non_query(&mut self, cmd: &mut Command) -> Result<u64, PqMiddlewareError> {
        cmd.execute_non_query(self.conn).await
    }

    /// # Errors
    /// Same as [`Command::execute_scalar`].
    pub async fn execute_scalar(
        &mut self,
        cmd: &mut Command,
    ) -> Result<Option<RowValues>, PqMiddlewareError> {
        cmd.execute_scalar(self.conn).await
    }

    /// # Errors
    /// Returns `PqMiddlewareError::QueryError` when the server rejects `COMMIT`.
    pub async fn commit(self) -> Result<(), PqMiddlewareError> {
        expect_command_ok(self.conn, "COMMIT").await?;
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// # Errors
    /// Returns `PqMiddlewareError::QueryError` when the server rejects `ROLLBACK`.
    pub async fn rollback(self) -> Result<(), PqMiddlewareError> {
        expect_command_ok(self.conn, "ROLLBACK").await?;
        tracing::debug!("transaction rolled back");
        Ok(())
    }
}
