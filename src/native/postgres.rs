//! [`NativeDriver`] over `tokio-postgres`.
//!
//! Parameterised statements go through the extended protocol
//! (`prepare_typed` + `query_raw`) with binary parameters and results; plain
//! SQL goes through `simple_query`. The in-flight request is held as a boxed
//! future and polled by [`NativeConnection::get_result`] and
//! [`NativeConnection::consume_input`].

use std::collections::VecDeque;
use std::error::Error;
use std::future::poll_fn;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use futures_util::future::BoxFuture;
use regex::Regex;
use tokio_postgres::config::{SslMode, TargetSessionAttrs};
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{
    CancelToken, Client, Config, NoTls, Row, RowStream, SimpleQueryMessage, Statement,
};
use tokio_util::bytes::{Bytes, BytesMut};

use super::{
    CancelHandle, ColumnDesc, ConnStatus, ExecStatus, NativeConnection, NativeDriver,
    ResultChunk, TransactionStatus,
};
use crate::codec::{FORMAT_BINARY, FORMAT_TEXT};
use crate::config::PoolKey;
use crate::error::{Diagnostics, PqMiddlewareError};
use crate::params::ParameterBuffer;
use crate::translation::split_statements;

static TX_BEGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(begin|start\s+transaction)\b").expect("static regex")
});
static TX_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(commit|end|abort|rollback)\b").expect("static regex")
});
static TX_SAVEPOINT_ROLLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*rollback(\s+(work|transaction))?\s+to\b").expect("static regex")
});

/// Apply the transaction-control keywords of statements that completed.
fn status_after_success(current: TransactionStatus, sql: &str) -> TransactionStatus {
    let mut status = current;
    for statement in split_statements(sql) {
        if TX_SAVEPOINT_ROLLBACK.is_match(&statement) {
            continue;
        }
        if TX_BEGIN.is_match(&statement) {
            status = TransactionStatus::InTransaction;
        } else if TX_END.is_match(&statement) {
            status = TransactionStatus::Idle;
        }
    }
    status
}

fn status_after_failure(current: TransactionStatus, sql: &str, closed: bool) -> TransactionStatus {
    let statements = split_statements(sql);
    let controls_tx = statements
        .iter()
        .any(|s| TX_BEGIN.is_match(s) || TX_END.is_match(s));
    if closed {
        TransactionStatus::Unknown
    } else if statements.len() > 1 && controls_tx {
        // Which statements ran before the failure is not observable here.
        TransactionStatus::Unknown
    } else if current.in_block() {
        TransactionStatus::InError
    } else {
        TransactionStatus::Idle
    }
}

/// Opens plain-TCP `tokio-postgres` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

#[async_trait]
impl NativeDriver for PgDriver {
    type Conn = PgConnection;

    async fn connect(&self, key: &PoolKey) -> Result<PgConnection, PqMiddlewareError> {
        let config = pg_config(key)?;
        let client = open(&config).await?;
        Ok(PgConnection {
            client,
            config,
            tx_status: TransactionStatus::Idle,
            in_flight: InFlight::Idle,
            ready: VecDeque::new(),
            last_error: String::new(),
            single_row: false,
            delivered: false,
        })
    }
}

/// Translate a descriptor into a `tokio-postgres` config.
///
/// # Errors
/// Returns `PqMiddlewareError::ConfigError` for values `tokio-postgres`
/// cannot honour.
pub fn pg_config(key: &PoolKey) -> Result<Config, PqMiddlewareError> {
    let mut config = Config::new();
    for (name, value) in key.iter() {
        match name {
            "host" => {
                config.host(value);
            }
            "hostaddr" => {
                let addr: IpAddr = value.parse().map_err(|_| {
                    PqMiddlewareError::ConfigError(format!("invalid hostaddr '{value}'"))
                })?;
                config.hostaddr(addr);
            }
            "user" => {
                config.user(value);
            }
            "password" => {
                config.password(value);
            }
            "dbname" => {
                config.dbname(value);
            }
            "options" => {
                config.options(value);
            }
            "application_name" => {
                config.application_name(value);
            }
            "sslmode" => {
                config.ssl_mode(match value {
                    "disable" => SslMode::Disable,
                    "allow" | "prefer" => SslMode::Prefer,
                    "require" | "verify-ca" | "verify-full" => SslMode::Require,
                    other => {
                        return Err(PqMiddlewareError::ConfigError(format!(
                            "invalid sslmode '{other}'"
                        )));
                    }
                });
            }
            "target_session_attrs" => {
                config.target_session_attrs(match value {
                    "any" => TargetSessionAttrs::Any,
                    "read-write" => TargetSessionAttrs::ReadWrite,
                    other => {
                        return Err(PqMiddlewareError::ConfigError(format!(
                            "unsupported target_session_attrs '{other}'"
                        )));
                    }
                });
            }
            "keepalives" => {
                config.keepalives(value != "0");
            }
            "keepalives_idle" => {
                let secs: u64 = value.parse().map_err(|_| {
                    PqMiddlewareError::ConfigError(format!("invalid keepalives_idle '{value}'"))
                })?;
                config.keepalives_idle(Duration::from_secs(secs));
            }
            "client_encoding" => {
                if !value.eq_ignore_ascii_case("utf8") && !value.eq_ignore_ascii_case("utf-8") {
                    return Err(PqMiddlewareError::ConfigError(format!(
                        "client_encoding '{value}' is not supported; only UTF8"
                    )));
                }
            }
            // Parsed below with their validation rules.
            "port" | "connect_timeout" => {}
            other => {
                return Err(PqMiddlewareError::ConfigError(format!(
                    "unrecognized option '{other}'"
                )));
            }
        }
    }
    if let Some(port) = key.port()? {
        config.port(port);
    }
    if let Some(timeout) = key.connect_timeout()? {
        config.connect_timeout(timeout);
    }
    if key.host().is_none() && key.get("hostaddr").is_none() {
        config.host("localhost");
    }
    Ok(config)
}

async fn open(config: &Config) -> Result<Arc<Client>, PqMiddlewareError> {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .map_err(|err| PqMiddlewareError::ConnectionError(err.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::warn!(error = %err, "postgres connection task ended with error");
        }
    });
    Ok(Arc::new(client))
}

fn diagnostics_of(err: &tokio_postgres::Error) -> Diagnostics {
    match err.as_db_error() {
        Some(db) => Diagnostics {
            severity: db.severity().to_string(),
            code: db.code().code().to_string(),
            message: db.message().to_string(),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
        },
        None => Diagnostics::new("08006", err.to_string()),
    }
}

/// Parameter bytes already encoded by the codec.
#[derive(Debug)]
struct EncodedParam(Option<Bytes>);

impl ToSql for EncodedParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match &self.0 {
            Some(bytes) => {
                out.extend_from_slice(bytes);
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// A cell's undecoded bytes.
struct RawCell(Bytes);

impl<'a> FromSql<'a> for RawCell {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(RawCell(Bytes::copy_from_slice(raw)))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn raw_row(row: &Row) -> Result<Vec<Option<Bytes>>, tokio_postgres::Error> {
    (0..row.len())
        .map(|idx| {
            row.try_get::<_, Option<RawCell>>(idx)
                .map(|cell| cell.map(|c| c.0))
        })
        .collect()
}

fn describe(statement: &Statement) -> Arc<[ColumnDesc]> {
    statement
        .columns()
        .iter()
        .map(|col| ColumnDesc {
            name: col.name().to_string(),
            type_oid: col.type_().oid(),
            size: -1,
            modifier: -1,
            format: FORMAT_BINARY,
        })
        .collect::<Vec<_>>()
        .into()
}

enum InFlight {
    Idle,
    Simple {
        future: BoxFuture<'static, Result<Vec<SimpleQueryMessage>, tokio_postgres::Error>>,
        sql: String,
    },
    Preparing {
        future: BoxFuture<'static, Result<(Statement, RowStream), tokio_postgres::Error>>,
        sql: String,
    },
    Streaming {
        // Held so the prepared statement outlives its rows.
        _statement: Statement,
        stream: Pin<Box<RowStream>>,
        columns: Arc<[ColumnDesc]>,
        rows: Vec<Vec<Option<Bytes>>>,
        sql: String,
    },
}

/// A `tokio-postgres` client driven through the [`NativeConnection`] protocol.
pub struct PgConnection {
    client: Arc<Client>,
    config: Config,
    tx_status: TransactionStatus,
    in_flight: InFlight,
    ready: VecDeque<ResultChunk>,
    last_error: String,
    single_row: bool,
    /// A result of the outstanding command has been handed out.
    delivered: bool,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .field("tx_status", &self.tx_status)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl PgConnection {
    fn ensure_dispatchable(&self) -> Result<(), PqMiddlewareError> {
        if self.client.is_closed() {
            return Err(PqMiddlewareError::ConnectionError(
                "connection is closed".into(),
            ));
        }
        if !matches!(self.in_flight, InFlight::Idle) || !self.ready.is_empty() {
            return Err(PqMiddlewareError::InvalidOperation(
                "another command is still outstanding".into(),
            ));
        }
        Ok(())
    }

    fn begin_dispatch(&mut self, in_flight: InFlight) {
        self.in_flight = in_flight;
        self.single_row = false;
        self.delivered = false;
        self.last_error.clear();
    }

    fn track_success(&mut self, sql: &str) {
        self.tx_status = status_after_success(self.tx_status, sql);
    }

    fn track_failure(&mut self, sql: &str, err: &tokio_postgres::Error) {
        let diagnostics = diagnostics_of(err);
        self.last_error = diagnostics.to_string();
        self.tx_status = status_after_failure(self.tx_status, sql, self.client.is_closed());
        self.ready.push_back(ResultChunk::error(diagnostics));
    }

    fn absorb_simple(&mut self, sql: &str, messages: Vec<SimpleQueryMessage>) {
        if sql.trim().is_empty() {
            self.ready.push_back(ResultChunk::new(ExecStatus::EmptyQuery));
            return;
        }
        let mut columns: Option<Arc<[ColumnDesc]>> = None;
        let mut rows = Vec::new();
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => {
                    let cols = columns.get_or_insert_with(|| {
                        row.columns()
                            .iter()
                            .map(|col| ColumnDesc {
                                name: col.name().to_string(),
                                type_oid: Type::TEXT.oid(),
                                size: -1,
                                modifier: -1,
                                format: FORMAT_TEXT,
                            })
                            .collect::<Vec<_>>()
                            .into()
                    });
                    let raw: Vec<Option<Bytes>> = (0..row.len())
                        .map(|idx| row.get(idx).map(|s| Bytes::copy_from_slice(s.as_bytes())))
                        .collect();
                    if self.single_row {
                        self.ready
                            .push_back(ResultChunk::single_row(Arc::clone(cols), raw));
                    } else {
                        rows.push(raw);
                    }
                }
                SimpleQueryMessage::CommandComplete(affected) => {
                    let chunk = match columns.take() {
                        Some(cols) => ResultChunk {
                            rows: std::mem::take(&mut rows),
                            ..ResultChunk::tuples_done(cols, Some(affected))
                        },
                        None => ResultChunk::command_ok(affected),
                    };
                    self.ready.push_back(chunk);
                }
                _ => {}
            }
        }
        self.track_success(sql);
    }

    /// Produce the next result, `None` once the outstanding command is done.
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Option<ResultChunk>> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                self.delivered = true;
                return Poll::Ready(Some(chunk));
            }
            match &mut self.in_flight {
                InFlight::Idle => return Poll::Ready(None),
                InFlight::Simple { future, sql } => {
                    let outcome = match future.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(outcome) => outcome,
                    };
                    let sql = std::mem::take(sql);
                    self.in_flight = InFlight::Idle;
                    match outcome {
                        Ok(messages) => self.absorb_simple(&sql, messages),
                        Err(err) => self.track_failure(&sql, &err),
                    }
                }
                InFlight::Preparing { future, sql } => {
                    let outcome = match future.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(outcome) => outcome,
                    };
                    let sql = std::mem::take(sql);
                    match outcome {
                        Ok((statement, stream)) => {
                            self.in_flight = InFlight::Streaming {
                                columns: describe(&statement),
                                _statement: statement,
                                stream: Box::pin(stream),
                                rows: Vec::new(),
                                sql,
                            };
                        }
                        Err(err) => {
                            self.in_flight = InFlight::Idle;
                            self.track_failure(&sql, &err);
                        }
                    }
                }
                InFlight::Streaming {
                    stream,
                    columns,
                    rows,
                    sql,
                    ..
                } => match stream.as_mut().poll_next(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(row))) => match raw_row(&row) {
                        Ok(raw) if self.single_row => {
                            self.ready
                                .push_back(ResultChunk::single_row(Arc::clone(columns), raw));
                        }
                        Ok(raw) => rows.push(raw),
                        Err(err) => {
                            let sql = std::mem::take(sql);
                            self.in_flight = InFlight::Idle;
                            self.track_failure(&sql, &err);
                        }
                    },
                    Poll::Ready(Some(Err(err))) => {
                        let sql = std::mem::take(sql);
                        self.in_flight = InFlight::Idle;
                        self.track_failure(&sql, &err);
                    }
                    Poll::Ready(None) => {
                        let affected = stream.rows_affected();
                        let chunk = if columns.is_empty() {
                            ResultChunk::command_ok(affected.unwrap_or(0))
                        } else {
                            ResultChunk {
                                rows: std::mem::take(rows),
                                ..ResultChunk::tuples_done(Arc::clone(columns), affected)
                            }
                        };
                        let sql = std::mem::take(sql);
                        self.in_flight = InFlight::Idle;
                        self.track_success(&sql);
                        self.ready.push_back(chunk);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl NativeConnection for PgConnection {
    type Cancel = PgCancel;

    fn status(&self) -> ConnStatus {
        if self.client.is_closed() {
            ConnStatus::Bad
        } else {
            ConnStatus::Ok
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.client.is_closed() {
            TransactionStatus::Unknown
        } else if !matches!(self.in_flight, InFlight::Idle) {
            TransactionStatus::Active
        } else {
            self.tx_status
        }
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    async fn send_query(&mut self, sql: &str) -> Result<(), PqMiddlewareError> {
        self.ensure_dispatchable()?;
        let client = Arc::clone(&self.client);
        let owned = sql.to_string();
        let future: BoxFuture<'static, _> =
            Box::pin(async move { client.simple_query(&owned).await });
        self.begin_dispatch(InFlight::Simple {
            future,
            sql: sql.to_string(),
        });
        Ok(())
    }

    async fn send_query_params(
        &mut self,
        sql: &str,
        params: &ParameterBuffer,
    ) -> Result<(), PqMiddlewareError> {
        self.ensure_dispatchable()?;
        let client = Arc::clone(&self.client);
        let owned = sql.to_string();
        let types = params.types().to_vec();
        let values: Vec<EncodedParam> = params
            .values()
            .iter()
            .cloned()
            .map(EncodedParam)
            .collect();
        let future: BoxFuture<'static, _> = Box::pin(async move {
            let statement = client.prepare_typed(&owned, &types).await?;
            let stream = client
                .query_raw(
                    &statement,
                    values.iter().map(|v| v as &(dyn ToSql + Sync)),
                )
                .await?;
            Ok::<_, tokio_postgres::Error>((statement, stream))
        });
        self.begin_dispatch(InFlight::Preparing {
            future,
            sql: sql.to_string(),
        });
        Ok(())
    }

    fn set_single_row_mode(&mut self) -> Result<(), PqMiddlewareError> {
        if matches!(self.in_flight, InFlight::Idle) || self.delivered {
            return Err(PqMiddlewareError::InvalidOperation(
                "single-row mode must be set right after dispatch".into(),
            ));
        }
        self.single_row = true;
        Ok(())
    }

    async fn consume_input(&mut self) -> Result<(), PqMiddlewareError> {
        let progressed = poll_fn(|cx| {
            Poll::Ready(match self.poll_step(cx) {
                Poll::Ready(chunk) => Some(chunk),
                Poll::Pending => None,
            })
        })
        .await;
        if let Some(Some(chunk)) = progressed {
            self.ready.push_front(chunk);
        }
        if self.client.is_closed() {
            return Err(PqMiddlewareError::ConnectionError(
                "connection is closed".into(),
            ));
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.ready.is_empty() && !matches!(self.in_flight, InFlight::Idle)
    }

    async fn get_result(&mut self) -> Option<ResultChunk> {
        poll_fn(|cx| self.poll_step(cx)).await
    }

    async fn reset(&mut self) -> Result<(), PqMiddlewareError> {
        self.in_flight = InFlight::Idle;
        self.ready.clear();
        let client = open(&self.config).await?;
        self.client = client;
        self.tx_status = TransactionStatus::Idle;
        self.last_error.clear();
        tracing::debug!("postgres connection re-established");
        Ok(())
    }

    async fn finish(self) {
        drop(self);
    }

    fn cancel_handle(&self) -> PgCancel {
        PgCancel(self.client.cancel_token())
    }
}

/// Cancels the running statement of a [`PgConnection`].
#[derive(Clone)]
pub struct PgCancel(CancelToken);

impl std::fmt::Debug for PgCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PgCancel")
    }
}

#[async_trait]
impl CancelHandle for PgCancel {
    async fn cancel(&self) -> Result<(), PqMiddlewareError> {
        self.0
            .cancel_query(NoTls)
            .await
            .map_err(|err| PqMiddlewareError::ConnectionError(format!("cancel failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_descriptor() {
        let key = PoolKey::from_pairs([
            ("host", "db1"),
            ("port", "6543"),
            ("user", "app"),
            ("dbname", "orders"),
            ("connect_timeout", "1"),
            ("application_name", "pqm"),
        ])
        .unwrap();
        let config = pg_config(&key).unwrap();
        assert_eq!(config.get_user(), Some("app"));
        assert_eq!(config.get_dbname(), Some("orders"));
        assert_eq!(config.get_ports(), [6543]);
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(2)));
        assert_eq!(config.get_application_name(), Some("pqm"));
    }

    #[test]
    fn config_rejects_unsupported_values() {
        let key = PoolKey::from_pairs([("sslmode", "sometimes")]).unwrap();
        assert!(matches!(
            pg_config(&key),
            Err(PqMiddlewareError::ConfigError(_))
        ));
        let key = PoolKey::from_pairs([("client_encoding", "LATIN1")]).unwrap();
        assert!(pg_config(&key).is_err());
        let key = PoolKey::from_pairs([("client_encoding", "UTF8")]).unwrap();
        assert!(pg_config(&key).is_ok());
    }

    #[test]
    fn transaction_keywords() {
        assert!(TX_BEGIN.is_match("  begin isolation level serializable"));
        assert!(TX_BEGIN.is_match("START TRANSACTION"));
        assert!(!TX_BEGIN.is_match("beginning"));
        assert!(TX_END.is_match("COMMIT"));
        assert!(TX_END.is_match("end"));
        assert!(TX_SAVEPOINT_ROLLBACK.is_match("ROLLBACK TO SAVEPOINT a"));
        assert!(TX_SAVEPOINT_ROLLBACK.is_match("rollback work to a"));
        assert!(!TX_SAVEPOINT_ROLLBACK.is_match("ROLLBACK"));
    }

    #[test]
    fn quoted_separators_do_not_change_transaction_status() {
        use TransactionStatus::{Idle, InTransaction, Unknown};

        assert_eq!(status_after_success(InTransaction, "select 'a;commit'"), InTransaction);
        assert_eq!(status_after_success(InTransaction, "select \"x;end\" from t"), InTransaction);
        let body = "do $$ begin; perform 1; end $$";
        assert_eq!(status_after_success(InTransaction, body), InTransaction);
        assert_eq!(status_after_success(Idle, "begin; select 1"), InTransaction);
        assert_eq!(status_after_success(InTransaction, "select 1; commit"), Idle);
        assert_eq!(
            status_after_success(InTransaction, "rollback to savepoint a"),
            InTransaction
        );

        assert_eq!(status_after_failure(Idle, "select 'begin;x'", false), Idle);
        assert_eq!(status_after_failure(Idle, "begin; select 1/0", false), Unknown);
        assert_eq!(
            status_after_failure(InTransaction, "select 'a;commit'", false),
            TransactionStatus::InError
        );
        assert_eq!(status_after_failure(Idle, "select 1", true), Unknown);
    }
}
