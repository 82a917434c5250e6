//! Streaming execution of a statement batch, one row at a time.

mod cursor;

use std::sync::Arc;

use tokio_postgres::types::Type;

pub use cursor::ColumnInfo;

use crate::codec;
use crate::error::{Diagnostics, PqMiddlewareError};
use crate::native::{ExecStatus, NativeConnection, ResultChunk};
use crate::params::ParameterBuffer;
use crate::results::{CustomDbRow, ResultSet};
use crate::types::RowValues;
use cursor::ReaderCursor;

/// Where a [`ResultStream`] is in its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing dispatched yet.
    Unstarted,
    /// Statement `i` dispatched, positioned before its first row.
    Executing(usize),
    /// Positioned on a row of statement `i`.
    RowAvailable(usize),
    /// Statement `i` has no more rows.
    CommandCompleted(usize),
    /// Every statement ran, an error ended the batch, or the stream was consumed.
    Done,
}

/// Runs statements one after another on a single connection and hands their
/// rows out one at a time.
///
/// Each statement is sent with the full parameter buffer in single-row mode.
/// A failing statement ends the batch: the connection is drained, the error is
/// returned, and later statements are never sent.
pub struct ResultStream<'c, C: NativeConnection> {
    conn: &'c mut C,
    statements: Vec<String>,
    params: ParameterBuffer,
    state: StreamState,
    cursor: ReaderCursor,
}

impl<C: NativeConnection> std::fmt::Debug for ResultStream<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("statements", &self.statements)
            .field("state", &self.state)
            .field("row", &self.cursor.row)
            .finish_non_exhaustive()
    }
}

impl<'c, C: NativeConnection> ResultStream<'c, C> {
    #[must_use]
    pub fn new(conn: &'c mut C, statements: Vec<String>, params: ParameterBuffer) -> Self {
        Self {
            conn,
            statements,
            params,
            state: StreamState::Unstarted,
            cursor: ReaderCursor::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Index of the active statement.
    #[must_use]
    pub fn statement_index(&self) -> Option<usize> {
        self.cursor.statement
    }

    /// Index of the current row within the active statement.
    #[must_use]
    pub fn row_index(&self) -> Option<usize> {
        self.cursor.current.as_ref().and(self.cursor.row)
    }

    /// Move to the next row of the active statement. Starts the first
    /// statement when nothing has run yet.
    ///
    /// # Errors
    /// `PqMiddlewareError::QueryError` when the server rejects the statement,
    /// `PqMiddlewareError::ProtocolError` for an unexpected result status. The
    /// connection has been drained in both cases.
    pub async fn advance(&mut self) -> Result<bool, PqMiddlewareError> {
        let index = match self.state {
            StreamState::Unstarted => {
                if !self.next_statement().await? {
                    return Ok(false);
                }
                self.cursor.statement.unwrap_or_default()
            }
            StreamState::Executing(i) | StreamState::RowAvailable(i) => i,
            StreamState::CommandCompleted(_) | StreamState::Done => return Ok(false),
        };

        self.fill().await?;
        if self.cursor.step() {
            self.state = StreamState::RowAvailable(index);
            Ok(true)
        } else {
            self.state = StreamState::CommandCompleted(index);
            Ok(false)
        }
    }

    /// Finish the active statement and start the next one. `false` once every
    /// statement has run.
    ///
    /// # Errors
    /// Same as [`ResultStream::advance`], plus the connection's error when the
    /// statement cannot be sent.
    pub async fn next_statement(&mut self) -> Result<bool, PqMiddlewareError> {
        let next = match self.state {
            StreamState::Done => return Ok(false),
            StreamState::Unstarted => 0,
            StreamState::Executing(i)
            | StreamState::RowAvailable(i)
            | StreamState::CommandCompleted(i) => {
                self.finish_statement().await?;
                i + 1
            }
        };

        let Some(sql) = self.statements.get(next) else {
            self.state = StreamState::Done;
            return Ok(false);
        };

        self.cursor.begin(next);
        tracing::debug!(statement = next, sql = %sql, "dispatching statement");
        if let Err(err) = self.conn.send_query_params(sql, &self.params).await {
            self.state = StreamState::Done;
            return Err(err);
        }
        if let Err(err) = self.conn.set_single_row_mode() {
            tracing::debug!(error = %err, "single-row mode unavailable; rows arrive in one batch");
        }
        self.state = StreamState::Executing(next);
        self.fill().await?;
        Ok(true)
    }

    /// Drain whatever is still pending on the connection and end the stream.
    /// No further statements are sent.
    pub async fn consume(&mut self) {
        if matches!(
            self.state,
            StreamState::Executing(_) | StreamState::RowAvailable(_)
        ) && !self.cursor.completed
        {
            let _ = self.drain().await;
        }
        self.cursor.discard_rows();
        self.cursor.completed = true;
        self.state = StreamState::Done;
    }

    /// [`ResultStream::consume`], taking the stream.
    pub async fn close(mut self) {
        self.consume().await;
    }

    /// A handle that cancels the running statement from another task. Call
    /// [`ResultStream::consume`] afterwards.
    #[must_use]
    pub fn cancel_handle(&self) -> C::Cancel {
        self.conn.cancel_handle()
    }

    /// Rows changed by the active statement; `None` for row-returning
    /// statements and until the statement completes.
    #[must_use]
    pub fn records_affected(&self) -> Option<u64> {
        self.cursor.rows_affected
    }

    /// The active statement produced at least one row.
    #[must_use]
    pub fn has_rows(&self) -> bool {
        self.cursor.saw_rows
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.cursor.schema.len()
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.cursor.schema
    }

    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` when `index` is out of range.
    pub fn column_name(&self, index: usize) -> Result<&str, PqMiddlewareError> {
        self.column(index).map(|col| col.name.as_str())
    }

    /// Column index by name: exact match first, then case-insensitive.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` when no column matches.
    pub fn ordinal(&self, name: &str) -> Result<usize, PqMiddlewareError> {
        if let Some(&idx) = self.cursor.column_index.get(name) {
            return Ok(idx);
        }
        self.cursor
            .column_names
            .iter()
            .position(|col| col.eq_ignore_ascii_case(name))
            .ok_or_else(|| PqMiddlewareError::InvalidOperation(format!("no column named {name}")))
    }

    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` without a current row or
    /// for an out-of-range index.
    pub fn is_null(&self, index: usize) -> Result<bool, PqMiddlewareError> {
        Ok(self.raw_cell(index)?.is_none())
    }

    /// Decoded value of a column in the current row.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::InvalidOperation` without a current row or
    /// for an out-of-range index, `PqMiddlewareError::ProtocolError` when the
    /// cell cannot be decoded.
    pub fn value(&self, index: usize) -> Result<RowValues, PqMiddlewareError> {
        let raw = self.raw_cell(index)?;
        let column = self.column(index)?;
        let ty = column.data_type.clone().unwrap_or(Type::UNKNOWN);
        codec::decode(&ty, column.format, raw.as_deref())
    }

    /// # Errors
    /// Same as [`ResultStream::ordinal`] and [`ResultStream::value`].
    pub fn value_by_name(&self, name: &str) -> Result<RowValues, PqMiddlewareError> {
        self.value(self.ordinal(name)?)
    }

    /// # Errors
    /// Same as [`ResultStream::value`].
    pub fn values(&self) -> Result<Vec<RowValues>, PqMiddlewareError> {
        (0..self.field_count()).map(|idx| self.value(idx)).collect()
    }

    /// The current row with shared column names.
    ///
    /// # Errors
    /// Same as [`ResultStream::value`].
    pub fn current_row(&self) -> Result<CustomDbRow, PqMiddlewareError> {
        Ok(CustomDbRow::with_index(
            Arc::clone(&self.cursor.column_names),
            Arc::clone(&self.cursor.column_index),
            self.values()?,
        ))
    }

    /// Read the rest of the active statement (including the current row) into
    /// a [`ResultSet`].
    ///
    /// # Errors
    /// Same as [`ResultStream::advance`].
    pub async fn read_result_set(&mut self) -> Result<ResultSet, PqMiddlewareError> {
        if self.state == StreamState::Unstarted && !self.next_statement().await? {
            return Ok(ResultSet::default());
        }
        let mut result_set = ResultSet::default();
        result_set.set_column_names(Arc::clone(&self.cursor.column_names));
        if matches!(self.state, StreamState::RowAvailable(_)) {
            result_set.add_row_values(self.values()?);
        }
        while self.advance().await? {
            result_set.add_row_values(self.values()?);
        }
        result_set.rows_affected = self
            .cursor
            .rows_affected
            .unwrap_or(result_set.len() as u64);
        Ok(result_set)
    }

    fn column(&self, index: usize) -> Result<&ColumnInfo, PqMiddlewareError> {
        self.cursor.schema.get(index).ok_or_else(|| {
            PqMiddlewareError::InvalidOperation(format!(
                "column {index} out of range ({} columns)",
                self.cursor.schema.len()
            ))
        })
    }

    fn raw_cell(&self, index: usize) -> Result<&Option<tokio_util::bytes::Bytes>, PqMiddlewareError> {
        let row = self
            .cursor
            .current
            .as_ref()
            .ok_or_else(|| PqMiddlewareError::InvalidOperation("no current row".into()))?;
        row.get(index).ok_or_else(|| {
            PqMiddlewareError::InvalidOperation(format!(
                "column {index} out of range ({} columns)",
                row.len()
            ))
        })
    }

    /// Pull chunks until a row is buffered or the statement completes.
    async fn fill(&mut self) -> Result<(), PqMiddlewareError> {
        while self.cursor.buffered.is_empty() && !self.cursor.completed {
            match self.conn.get_result().await {
                Some(chunk) => self.absorb(chunk).await?,
                None => self.cursor.completed = true,
            }
        }
        Ok(())
    }

    async fn absorb(&mut self, chunk: ResultChunk) -> Result<(), PqMiddlewareError> {
        match chunk.status {
            ExecStatus::SingleTuple => {
                self.cursor.capture_schema(&chunk.columns);
                self.cursor.buffer_rows(chunk.rows);
                Ok(())
            }
            ExecStatus::TuplesOk | ExecStatus::CommandOk | ExecStatus::EmptyQuery => {
                self.cursor.capture_schema(&chunk.columns);
                self.cursor.buffer_rows(chunk.rows);
                if chunk.status == ExecStatus::CommandOk {
                    self.cursor.rows_affected = chunk.rows_affected;
                }
                if let Some(diag) = self.drain().await {
                    return Err(self.fail(PqMiddlewareError::QueryError(diag)));
                }
                self.cursor.completed = true;
                Ok(())
            }
            ExecStatus::FatalError | ExecStatus::NonfatalError => {
                let diag = chunk
                    .diagnostics
                    .unwrap_or_else(|| self.connection_diagnostics());
                let _ = self.drain().await;
                Err(self.fail(PqMiddlewareError::QueryError(diag)))
            }
            ExecStatus::CopyIn | ExecStatus::CopyOut | ExecStatus::BadResponse => {
                let _ = self.drain().await;
                Err(self.fail(PqMiddlewareError::ProtocolError(format!(
                    "unexpected result status {:?}",
                    chunk.status
                ))))
            }
        }
    }

    /// Drop the rest of the active statement. An error reported while draining
    /// still surfaces.
    async fn finish_statement(&mut self) -> Result<(), PqMiddlewareError> {
        self.cursor.discard_rows();
        if !self.cursor.completed {
            self.cursor.completed = true;
            if let Some(diag) = self.drain().await {
                return Err(self.fail(PqMiddlewareError::QueryError(diag)));
            }
        }
        Ok(())
    }

    /// Read results until the connection reports none; returns the first error.
    async fn drain(&mut self) -> Option<Diagnostics> {
        let mut first_error = None;
        while let Some(chunk) = self.conn.get_result().await {
            if first_error.is_none() && chunk.status.is_error() {
                first_error = Some(
                    chunk
                        .diagnostics
                        .unwrap_or_else(|| self.connection_diagnostics()),
                );
            }
        }
        first_error
    }

    fn connection_diagnostics(&self) -> Diagnostics {
        Diagnostics::new("XX000", self.conn.error_message())
    }

    fn fail(&mut self, err: PqMiddlewareError) -> PqMiddlewareError {
        tracing::debug!(statement = ?self.cursor.statement, error = %err, "statement failed; batch stopped");
        self.cursor.discard_rows();
        self.cursor.completed = true;
        self.state = StreamState::Done;
        err
    }
}
