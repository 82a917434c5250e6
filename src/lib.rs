//! Pooled Postgres connections with named-parameter statement batches and
//! row-at-a-time result streaming.
//!
//! - [`ConnectionPool`] keeps idle connections per [`PoolKey`], validates them
//!   on checkout and resets session state on release.
//! - [`parse_statements`] splits a batch on top-level `;` and rewrites
//!   `:name` parameters to positional `$n` placeholders.
//! - [`ResultStream`] runs the statements one by one and hands out rows as
//!   they arrive.
//!
//! The wire protocol sits behind the [`native`] traits; [`PgDriver`] is the
//! `tokio-postgres` implementation.

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod native;
pub mod params;
pub mod pool;
pub mod prelude;
pub mod reader;
pub mod results;
pub mod transaction;
pub mod translation;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use command::{Command, CommandType};
pub use config::{PoolKey, PoolSettings, RECOGNIZED_KEYS};
pub use error::{Diagnostics, PqMiddlewareError};
pub use native::postgres::{PgCancel, PgConnection, PgDriver};
pub use native::{CancelHandle, NativeConnection, NativeDriver};
pub use params::{BoundParameter, ParameterBuffer, ParameterSet};
pub use pool::{ConnectionPool, PooledConnection};
pub use reader::{ColumnInfo, ResultStream, StreamState};
pub use results::{CustomDbRow, ResultSet};
pub use transaction::{IsolationLevel, Transaction};
pub use translation::{ParsedStatements, parse_statements};
pub use types::{ParameterDirection, RowValues};
