//! Convenient imports for common functionality.

pub use crate::command::{Command, CommandType};
pub use crate::config::{PoolKey, PoolSettings};
pub use crate::error::{Diagnostics, PqMiddlewareError};
pub use crate::native::postgres::PgDriver;
pub use crate::native::{CancelHandle, NativeConnection, NativeDriver};
pub use crate::params::ParameterSet;
pub use crate::pool::{ConnectionPool, PooledConnection};
pub use crate::reader::{ResultStream, StreamState};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::transaction::IsolationLevel;
pub use crate::translation::parse_statements;
pub use crate::types::{ParameterDirection, RowValues};
