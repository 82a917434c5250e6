//! Seam between the pool / result stream and the library that speaks the wire
//! protocol. [`postgres::PgDriver`] implements it over `tokio-postgres`; the
//! `test-utils` feature adds a scripted in-memory implementation.

use async_trait::async_trait;

use crate::config::PoolKey;
use crate::error::{Diagnostics, PqMiddlewareError};
use crate::params::ParameterBuffer;

pub mod postgres;
mod result;

pub use result::{ColumnDesc, ConnStatus, ExecStatus, ResultChunk, TransactionStatus};

/// Opens physical connections for a descriptor.
#[async_trait]
pub trait NativeDriver: Send + Sync + 'static {
    type Conn: NativeConnection;

    /// # Errors
    /// Returns an error when the connection cannot be established.
    async fn connect(&self, key: &PoolKey) -> Result<Self::Conn, PqMiddlewareError>;
}

/// Out-of-band cancellation of whatever is running on a connection.
#[async_trait]
pub trait CancelHandle: Send + Sync + 'static {
    /// # Errors
    /// Returns an error when the cancel request could not be delivered.
    async fn cancel(&self) -> Result<(), PqMiddlewareError>;
}

/// One physical connection.
///
/// Dispatch is asynchronous: `send_*` queues a command, results are pulled
/// with [`NativeConnection::get_result`] until it yields `None`. Only one
/// command may be outstanding at a time.
#[async_trait]
pub trait NativeConnection: Send + 'static {
    type Cancel: CancelHandle;

    fn status(&self) -> ConnStatus;

    fn transaction_status(&self) -> TransactionStatus;

    /// Last error reported by the connection, empty when none.
    fn error_message(&self) -> String;

    /// Queue a parameterless command (may hold several statements).
    ///
    /// # Errors
    /// Fails when the connection is broken or a command is already outstanding.
    async fn send_query(&mut self, sql: &str) -> Result<(), PqMiddlewareError>;

    /// Queue one statement with positional parameters.
    ///
    /// # Errors
    /// Fails when the connection is broken or a command is already outstanding.
    async fn send_query_params(
        &mut self,
        sql: &str,
        params: &ParameterBuffer,
    ) -> Result<(), PqMiddlewareError>;

    /// Deliver rows of the outstanding command one chunk per row.
    ///
    /// # Errors
    /// Fails when no command is outstanding or results were already read.
    fn set_single_row_mode(&mut self) -> Result<(), PqMiddlewareError>;

    /// Make progress on the outstanding command without waiting.
    ///
    /// # Errors
    /// Fails when the connection is broken.
    async fn consume_input(&mut self) -> Result<(), PqMiddlewareError>;

    /// True while [`NativeConnection::get_result`] would have to wait.
    fn is_busy(&self) -> bool;

    /// Next result of the outstanding command, `None` once it is complete.
    async fn get_result(&mut self) -> Option<ResultChunk>;

    /// Run `sql` to completion; the last result wins.
    async fn exec(&mut self, sql: &str) -> ResultChunk {
        if let Err(err) = self.send_query(sql).await {
            return ResultChunk::error(Diagnostics::new("08006", err.to_string()));
        }
        let mut last = ResultChunk::new(ExecStatus::EmptyQuery);
        while let Some(chunk) = self.get_result().await {
            // Keep the first error even when later results follow it.
            if !last.status.is_error() {
                last = chunk;
            }
        }
        last
    }

    /// Re-establish the connection in place.
    ///
    /// # Errors
    /// Fails when reconnecting fails; the connection stays broken.
    async fn reset(&mut self) -> Result<(), PqMiddlewareError>;

    /// Close the connection.
    async fn finish(self);

    fn cancel_handle(&self) -> Self::Cancel;
}
