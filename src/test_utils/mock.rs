//! Scripted in-memory server implementing the native seam.
//!
//! Statements are answered from a script keyed by their trimmed SQL text;
//! anything unscripted completes as a command touching zero rows. The server
//! tracks transaction blocks, connection lifecycle and cancellation so pool
//! and stream behaviour can be checked without a database.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_postgres::types::Type;

use crate::codec;
use crate::config::PoolKey;
use crate::error::{Diagnostics, PqMiddlewareError};
use crate::native::{
    CancelHandle, ColumnDesc, ConnStatus, ExecStatus, NativeConnection, NativeDriver,
    ResultChunk, TransactionStatus,
};
use crate::params::ParameterBuffer;
use crate::reader::ColumnInfo;
use crate::types::RowValues;

type RawRow = Vec<Option<tokio_util::bytes::Bytes>>;

/// How the server answers one statement.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows {
        columns: Vec<(String, Type)>,
        rows: Vec<Vec<RowValues>>,
    },
    Command(u64),
    Error(Diagnostics),
    /// One row holding the bound parameters as sent, columns `$1..$n`.
    Echo,
}

impl MockResponse {
    #[must_use]
    pub fn rows(columns: &[(&str, Type)], rows: Vec<Vec<RowValues>>) -> Self {
        MockResponse::Rows {
            columns: columns
                .iter()
                .map(|(name, ty)| ((*name).to_string(), ty.clone()))
                .collect(),
            rows,
        }
    }

    #[must_use]
    pub fn error(code: &str, message: &str) -> Self {
        MockResponse::Error(Diagnostics::new(code, message))
    }
}

#[derive(Debug, Default)]
struct ServerState {
    scripts: HashMap<String, MockResponse>,
    executed: Vec<String>,
    connects: usize,
    closes: usize,
    resets: usize,
    cancels: usize,
    fail_connect: bool,
    fail_reset: bool,
    busy_polls: u32,
    next_id: u64,
    open: HashSet<u64>,
    killed: HashSet<u64>,
}

/// Shared state behind every [`MockDriver`] and [`MockConnection`] it hands out.
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn driver(&self) -> MockDriver {
        MockDriver {
            server: self.clone(),
        }
    }

    /// Answer `sql` (compared after trimming) with `response`.
    pub fn script(&self, sql: &str, response: MockResponse) {
        self.lock().scripts.insert(sql.trim().to_string(), response);
    }

    /// Every statement dispatched so far, in order, across all connections.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Dispatched statements other than pool housekeeping (probes and resets).
    #[must_use]
    pub fn user_statements(&self) -> Vec<String> {
        self.lock()
            .executed
            .iter()
            .filter(|sql| !sql.is_empty() && *sql != "DISCARD ALL")
            .cloned()
            .collect()
    }

    pub fn clear_executed(&self) {
        self.lock().executed.clear();
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    #[must_use]
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    #[must_use]
    pub fn cancels(&self) -> usize {
        self.lock().cancels
    }

    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.lock().open.len()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn set_fail_reset(&self, fail: bool) {
        self.lock().fail_reset = fail;
    }

    /// Polls a dispatched command stays busy for before results are readable.
    pub fn set_busy_polls(&self, polls: u32) {
        self.lock().busy_polls = polls;
    }

    /// Break the socket of every open connection.
    pub fn kill_all(&self) {
        let mut state = self.lock();
        let open: Vec<u64> = state.open.iter().copied().collect();
        state.killed.extend(open);
    }
}

#[derive(Debug, Clone)]
pub struct MockDriver {
    server: MockServer,
}

impl MockDriver {
    #[must_use]
    pub fn server(&self) -> &MockServer {
        &self.server
    }
}

#[async_trait]
impl NativeDriver for MockDriver {
    type Conn = MockConnection;

    async fn connect(&self, key: &PoolKey) -> Result<MockConnection, PqMiddlewareError> {
        let mut state = self.server.lock();
        if state.fail_connect {
            return Err(PqMiddlewareError::ConnectionError(format!(
                "could not connect to {key}"
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.connects += 1;
        state.open.insert(id);
        Ok(MockConnection {
            id,
            server: self.server.clone(),
            tx: TransactionStatus::Idle,
            pending: VecDeque::new(),
            busy_remaining: 0,
            single_row: false,
            delivered: false,
            last_error: String::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Debug)]
enum Outcome {
    Rows {
        columns: Arc<[ColumnDesc]>,
        rows: VecDeque<RawRow>,
        affected: u64,
    },
    Chunk(ResultChunk),
}

/// One connection to a [`MockServer`].
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    server: MockServer,
    tx: TransactionStatus,
    pending: VecDeque<Outcome>,
    busy_remaining: u32,
    single_row: bool,
    delivered: bool,
    last_error: String,
    cancel_requested: Arc<AtomicBool>,
}

fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    sql.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && sql[keyword.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_')
}

fn encode_rows(
    columns: &[(String, Type)],
    rows: &[Vec<RowValues>],
) -> Result<(Arc<[ColumnDesc]>, VecDeque<RawRow>), PqMiddlewareError> {
    let descs: Vec<ColumnDesc> = columns
        .iter()
        .map(|(name, ty)| ColumnDesc {
            name: name.clone(),
            type_oid: ty.oid(),
            size: -1,
            modifier: -1,
            format: codec::FORMAT_BINARY,
        })
        .collect();
    let mut raw = VecDeque::with_capacity(rows.len());
    for row in rows {
        let cells = columns
            .iter()
            .zip(row)
            .map(|((_, ty), value)| codec::encode(value, ty))
            .collect::<Result<Vec<_>, _>>()?;
        raw.push_back(cells);
    }
    Ok((descs.into(), raw))
}

impl MockConnection {
    /// Server id, stable across resets.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn broken(&self) -> bool {
        self.server.lock().killed.contains(&self.id)
    }

    fn ensure_dispatchable(&self) -> Result<(), PqMiddlewareError> {
        if self.broken() {
            return Err(PqMiddlewareError::ConnectionError(
                "server closed the connection unexpectedly".into(),
            ));
        }
        if !self.pending.is_empty() {
            return Err(PqMiddlewareError::InvalidOperation(
                "another command is still outstanding".into(),
            ));
        }
        Ok(())
    }

    fn begin_dispatch(&mut self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.single_row = false;
        self.delivered = false;
        self.last_error.clear();
        self.busy_remaining = self.server.lock().busy_polls;
    }

    fn fail(&mut self, diagnostics: Diagnostics) -> bool {
        self.last_error = diagnostics.to_string();
        if self.tx.in_block() {
            self.tx = TransactionStatus::InError;
        }
        self.pending.push_back(Outcome::Chunk(ResultChunk::error(diagnostics)));
        false
    }

    /// Queue the outcome of one statement; `false` when it failed.
    fn run_statement(&mut self, sql: &str, params: Option<&ParameterBuffer>) -> bool {
        let sql = sql.trim();
        let script = {
            let mut state = self.server.lock();
            state.executed.push(sql.to_string());
            state.scripts.get(sql).cloned()
        };

        if sql.is_empty() {
            self.pending
                .push_back(Outcome::Chunk(ResultChunk::new(ExecStatus::EmptyQuery)));
            return true;
        }

        let to_savepoint = sql.to_ascii_lowercase().contains(" to ");
        if starts_with_keyword(sql, "rollback") && to_savepoint && self.tx.in_block() {
            self.tx = TransactionStatus::InTransaction;
            self.pending.push_back(Outcome::Chunk(ResultChunk::command_ok(0)));
            return true;
        }
        let ends_block = starts_with_keyword(sql, "commit")
            || starts_with_keyword(sql, "end")
            || starts_with_keyword(sql, "abort")
            || (starts_with_keyword(sql, "rollback") && !to_savepoint);
        if self.tx == TransactionStatus::InError && !ends_block {
            return self.fail(Diagnostics::new(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        if starts_with_keyword(sql, "begin") || starts_with_keyword(sql, "start") {
            self.tx = TransactionStatus::InTransaction;
            self.pending.push_back(Outcome::Chunk(ResultChunk::command_ok(0)));
            return true;
        }
        if ends_block {
            self.tx = TransactionStatus::Idle;
            self.pending.push_back(Outcome::Chunk(ResultChunk::command_ok(0)));
            return true;
        }
        if sql.eq_ignore_ascii_case("discard all") && self.tx.in_block() {
            return self.fail(Diagnostics::new(
                "25001",
                "DISCARD ALL cannot run inside a transaction block",
            ));
        }

        match script {
            None => {
                self.pending.push_back(Outcome::Chunk(ResultChunk::command_ok(0)));
                true
            }
            Some(MockResponse::Command(affected)) => {
                self.pending
                    .push_back(Outcome::Chunk(ResultChunk::command_ok(affected)));
                true
            }
            Some(MockResponse::Error(diagnostics)) => self.fail(diagnostics),
            Some(MockResponse::Rows { columns, rows }) => match encode_rows(&columns, &rows) {
                Ok((columns, rows)) => {
                    let affected = rows.len() as u64;
                    self.pending.push_back(Outcome::Rows {
                        columns,
                        rows,
                        affected,
                    });
                    true
                }
                Err(err) => self.fail(Diagnostics::new("22000", err.to_string())),
            },
            Some(MockResponse::Echo) => {
                let buffer = params.cloned().unwrap_or_default();
                let columns: Vec<ColumnDesc> = buffer
                    .types()
                    .iter()
                    .enumerate()
                    .map(|(idx, ty)| ColumnDesc {
                        name: format!("${}", idx + 1),
                        type_oid: ty.oid(),
                        size: -1,
                        modifier: -1,
                        format: codec::FORMAT_BINARY,
                    })
                    .collect();
                self.pending.push_back(Outcome::Rows {
                    columns: columns.into(),
                    rows: VecDeque::from([buffer.values().to_vec()]),
                    affected: 1,
                });
                true
            }
        }
    }

    fn next_chunk(&mut self) -> Option<ResultChunk> {
        if let Some(Outcome::Rows { columns, rows, .. }) = self.pending.front_mut()
            && self.single_row
            && let Some(row) = rows.pop_front()
        {
            return Some(ResultChunk::single_row(Arc::clone(columns), row));
        }
        match self.pending.pop_front()? {
            Outcome::Rows {
                columns,
                rows,
                affected,
            } => Some(ResultChunk {
                rows: rows.into_iter().collect(),
                ..ResultChunk::tuples_done(columns, Some(affected))
            }),
            Outcome::Chunk(chunk) => Some(chunk),
        }
    }
}

#[async_trait]
impl NativeConnection for MockConnection {
    type Cancel = MockCancel;

    fn status(&self) -> ConnStatus {
        if self.broken() {
            ConnStatus::Bad
        } else {
            ConnStatus::Ok
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.broken() {
            TransactionStatus::Unknown
        } else if !self.pending.is_empty() {
            TransactionStatus::Active
        } else {
            self.tx
        }
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    async fn send_query(&mut self, sql: &str) -> Result<(), PqMiddlewareError> {
        self.ensure_dispatchable()?;
        self.begin_dispatch();
        let statements: Vec<&str> = sql.split(';').filter(|s| !s.trim().is_empty()).collect();
        if statements.is_empty() {
            self.run_statement("", None);
        }
        for statement in statements {
            if !self.run_statement(statement, None) {
                break;
            }
        }
        Ok(())
    }

    async fn send_query_params(
        &mut self,
        sql: &str,
        params: &ParameterBuffer,
    ) -> Result<(), PqMiddlewareError> {
        self.ensure_dispatchable()?;
        self.begin_dispatch();
        self.run_statement(sql, Some(params));
        Ok(())
    }

    fn set_single_row_mode(&mut self) -> Result<(), PqMiddlewareError> {
        if self.pending.is_empty() || self.delivered {
            return Err(PqMiddlewareError::InvalidOperation(
                "single-row mode must be set right after dispatch".into(),
            ));
        }
        self.single_row = true;
        Ok(())
    }

    async fn consume_input(&mut self) -> Result<(), PqMiddlewareError> {
        if self.broken() {
            return Err(PqMiddlewareError::ConnectionError(
                "server closed the connection unexpectedly".into(),
            ));
        }
        self.busy_remaining = self.busy_remaining.saturating_sub(1);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        !self.pending.is_empty() && self.busy_remaining > 0
    }

    async fn get_result(&mut self) -> Option<ResultChunk> {
        if self.pending.is_empty() {
            return None;
        }
        self.busy_remaining = 0;
        self.delivered = true;
        if self.broken() {
            self.pending.clear();
            self.last_error = "server closed the connection unexpectedly".into();
            return Some(ResultChunk::error(Diagnostics::new(
                "08006",
                "server closed the connection unexpectedly",
            )));
        }
        if self.cancel_requested.swap(false, Ordering::SeqCst) {
            self.pending.clear();
            let diagnostics = Diagnostics::new("57014", "canceling statement due to user request");
            self.last_error = diagnostics.to_string();
            if self.tx.in_block() {
                self.tx = TransactionStatus::InError;
            }
            return Some(ResultChunk::error(diagnostics));
        }
        self.next_chunk()
    }

    async fn reset(&mut self) -> Result<(), PqMiddlewareError> {
        let mut state = self.server.lock();
        if state.fail_reset {
            return Err(PqMiddlewareError::ConnectionError("reset refused".into()));
        }
        state.resets += 1;
        state.killed.remove(&self.id);
        drop(state);
        self.pending.clear();
        self.tx = TransactionStatus::Idle;
        self.last_error.clear();
        Ok(())
    }

    async fn finish(self) {
        let mut state = self.server.lock();
        state.closes += 1;
        state.open.remove(&self.id);
    }

    fn cancel_handle(&self) -> MockCancel {
        MockCancel {
            requested: Arc::clone(&self.cancel_requested),
            server: self.server.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockCancel {
    requested: Arc<AtomicBool>,
    server: MockServer,
}

#[async_trait]
impl CancelHandle for MockCancel {
    async fn cancel(&self) -> Result<(), PqMiddlewareError> {
        self.server.lock().cancels += 1;
        self.requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Column names of a stream's schema, for assertions.
#[must_use]
pub fn column_names(columns: &[ColumnInfo]) -> Vec<&str> {
    columns.iter().map(|col| col.name.as_str()).collect()
}
