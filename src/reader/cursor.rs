use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio_postgres::types::Type;
use tokio_util::bytes::Bytes;

use crate::native::ColumnDesc;
use crate::results::build_index;

/// Column schema of the active statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    /// Server type name, `"unknown"` for types the codec does not know.
    pub type_name: String,
    pub size: i16,
    pub modifier: i32,
    pub format: i16,
    #[serde(skip)]
    pub data_type: Option<Type>,
}

impl From<&ColumnDesc> for ColumnInfo {
    fn from(desc: &ColumnDesc) -> Self {
        let data_type = Type::from_oid(desc.type_oid);
        Self {
            name: desc.name.clone(),
            type_oid: desc.type_oid,
            type_name: data_type
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |ty| ty.name().to_string()),
            size: desc.size,
            modifier: desc.modifier,
            format: desc.format,
            data_type,
        }
    }
}

pub(crate) type RawRow = Vec<Option<Bytes>>;

/// Position of a [`super::ResultStream`] inside its active statement.
#[derive(Debug)]
pub(crate) struct ReaderCursor {
    pub(crate) statement: Option<usize>,
    pub(crate) row: Option<usize>,
    pub(crate) schema: Arc<[ColumnInfo]>,
    pub(crate) column_names: Arc<Vec<String>>,
    pub(crate) column_index: Arc<HashMap<String, usize>>,
    pub(crate) schema_captured: bool,
    /// Rows received but not yet handed out.
    pub(crate) buffered: VecDeque<RawRow>,
    pub(crate) current: Option<RawRow>,
    /// The statement's completion marker has been seen and drained.
    pub(crate) completed: bool,
    pub(crate) rows_affected: Option<u64>,
    pub(crate) saw_rows: bool,
}

impl Default for ReaderCursor {
    fn default() -> Self {
        Self {
            statement: None,
            row: None,
            schema: Arc::from(Vec::new()),
            column_names: Arc::default(),
            column_index: Arc::default(),
            schema_captured: false,
            buffered: VecDeque::new(),
            current: None,
            completed: false,
            rows_affected: None,
            saw_rows: false,
        }
    }
}

impl ReaderCursor {
    pub(crate) fn begin(&mut self, statement: usize) {
        *self = ReaderCursor {
            statement: Some(statement),
            ..ReaderCursor::default()
        };
    }

    pub(crate) fn capture_schema(&mut self, columns: &[ColumnDesc]) {
        if self.schema_captured {
            return;
        }
        let schema: Vec<ColumnInfo> = columns.iter().map(ColumnInfo::from).collect();
        let names: Vec<String> = schema.iter().map(|col| col.name.clone()).collect();
        self.column_index = build_index(&names);
        self.column_names = Arc::new(names);
        self.schema = Arc::from(schema);
        self.schema_captured = true;
    }

    pub(crate) fn buffer_rows(&mut self, rows: Vec<RawRow>) {
        if !rows.is_empty() {
            self.saw_rows = true;
        }
        self.buffered.extend(rows);
    }

    /// Move the next buffered row into `current`.
    pub(crate) fn step(&mut self) -> bool {
        self.current = self.buffered.pop_front();
        if self.current.is_some() {
            self.row = Some(self.row.map_or(0, |r| r + 1));
            true
        } else {
            false
        }
    }

    pub(crate) fn discard_rows(&mut self) {
        self.buffered.clear();
        self.current = None;
    }
}
