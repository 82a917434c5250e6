use std::collections::HashMap;
use std::sync::Arc;

use crate::types::RowValues;

/// A row materialized from a result stream
///
/// Column names and the name → index map are shared by every row of the
/// same statement.
#[derive(Debug, Clone)]
pub struct CustomDbRow {
    /// The column names for this row (shared across all rows in a result set)
    pub column_names: Arc<Vec<String>>,
    /// The values for this row
    pub rows: Vec<RowValues>,
    #[doc(hidden)]
    pub(crate) column_index_cache: Arc<HashMap<String, usize>>,
}

pub(crate) fn build_index(column_names: &[String]) -> Arc<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(column_names.len());
    for (i, name) in column_names.iter().enumerate() {
        // First occurrence wins for duplicated column names.
        index.entry(name.clone()).or_insert(i);
    }
    Arc::new(index)
}

impl CustomDbRow {
    /// Create a row, building the column index.
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, rows: Vec<RowValues>) -> Self {
        let column_index_cache = build_index(&column_names);
        Self {
            column_names,
            rows,
            column_index_cache,
        }
    }

    pub(crate) fn with_index(
        column_names: Arc<Vec<String>>,
        column_index_cache: Arc<HashMap<String, usize>>,
        rows: Vec<RowValues>,
    ) -> Self {
        Self {
            column_names,
            rows,
            column_index_cache,
        }
    }

    /// Index of a column: exact match first, then case-insensitive.
    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        if let Some(&idx) = self.column_index_cache.get(column_name) {
            return Some(idx);
        }
        self.column_names
            .iter()
            .position(|col| col.eq_ignore_ascii_case(column_name))
    }

    /// Value of a column by name, `None` when the column does not exist.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.get_column_index(column_name)
            .and_then(|idx| self.rows.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.rows.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_case_insensitive() {
        let row = CustomDbRow::new(
            Arc::new(vec!["Id".into(), "name".into()]),
            vec![RowValues::Int(1), RowValues::Text("a".into())],
        );
        assert_eq!(row.get("Id"), Some(&RowValues::Int(1)));
        assert_eq!(row.get("ID"), Some(&RowValues::Int(1)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.get_by_index(1), Some(&RowValues::Text("a".into())));
    }
}
