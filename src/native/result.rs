use std::sync::Arc;

use tokio_util::bytes::Bytes;

use crate::error::Diagnostics;

/// Completion status of one result chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    SingleTuple,
    CopyOut,
    CopyIn,
    BadResponse,
    NonfatalError,
    FatalError,
}

impl ExecStatus {
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, ExecStatus::FatalError | ExecStatus::NonfatalError)
    }
}

/// Physical connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// Server-side transaction state as last observed by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    /// A command is in flight.
    Active,
    InTransaction,
    InError,
    Unknown,
}

impl TransactionStatus {
    /// Inside an open or failed transaction block.
    #[must_use]
    pub fn in_block(self) -> bool {
        matches!(
            self,
            TransactionStatus::InTransaction | TransactionStatus::InError
        )
    }
}

/// Column metadata as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub type_oid: u32,
    pub size: i16,
    pub modifier: i32,
    /// 0 = text, 1 = binary.
    pub format: i16,
}

/// One result from the native library: a single row in single-row mode, a
/// completion marker, or an error report.
#[derive(Debug, Clone)]
pub struct ResultChunk {
    pub status: ExecStatus,
    pub columns: Arc<[ColumnDesc]>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub rows_affected: Option<u64>,
    pub diagnostics: Option<Diagnostics>,
}

impl ResultChunk {
    #[must_use]
    pub fn new(status: ExecStatus) -> Self {
        Self {
            status,
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            rows_affected: None,
            diagnostics: None,
        }
    }

    #[must_use]
    pub fn command_ok(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::new(ExecStatus::CommandOk)
        }
    }

    #[must_use]
    pub fn single_row(columns: Arc<[ColumnDesc]>, row: Vec<Option<Bytes>>) -> Self {
        Self {
            columns,
            rows: vec![row],
            ..Self::new(ExecStatus::SingleTuple)
        }
    }

    /// End-of-rows marker for a row-returning statement.
    #[must_use]
    pub fn tuples_done(columns: Arc<[ColumnDesc]>, rows_affected: Option<u64>) -> Self {
        Self {
            columns,
            rows_affected,
            ..Self::new(ExecStatus::TuplesOk)
        }
    }

    #[must_use]
    pub fn error(diagnostics: Diagnostics) -> Self {
        Self {
            diagnostics: Some(diagnostics),
            ..Self::new(ExecStatus::FatalError)
        }
    }
}
