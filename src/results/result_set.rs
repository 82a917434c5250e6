use std::collections::HashMap;
use std::sync::Arc;

use super::row::{CustomDbRow, build_index};
use crate::types::RowValues;

/// All rows of one statement, read to completion
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the statement
    pub results: Vec<CustomDbRow>,
    /// Rows reported by the server as affected (`INSERT`/`UPDATE`/...), or the
    /// number of rows read for a query
    pub rows_affected: u64,
    column_names: Option<Arc<Vec<String>>>,
    column_index: Option<Arc<HashMap<String, usize>>>,
}

impl ResultSet {
    /// Set the column names shared by all rows
    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_index = Some(build_index(&column_names));
        self.column_names = Some(column_names);
    }

    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Add a row built from bare values; ignored until column names are set.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        if let (Some(names), Some(index)) = (&self.column_names, &self.column_index) {
            self.results.push(CustomDbRow::with_index(
                Arc::clone(names),
                Arc::clone(index),
                row_values,
            ));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// First column of the first row.
    #[must_use]
    pub fn scalar(&self) -> Option<&RowValues> {
        self.results.first().and_then(|row| row.get_by_index(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_share_column_metadata() {
        let mut rs = ResultSet::default();
        rs.add_row_values(vec![RowValues::Int(0)]);
        assert!(rs.is_empty());

        rs.set_column_names(Arc::new(vec!["n".into()]));
        rs.add_row_values(vec![RowValues::Int(1)]);
        rs.add_row_values(vec![RowValues::Int(2)]);
        assert_eq!(rs.len(), 2);
        assert!(Arc::ptr_eq(
            &rs.results[0].column_names,
            &rs.results[1].column_names
        ));
        assert_eq!(rs.scalar(), Some(&RowValues::Int(1)));
        assert_eq!(rs.results[1].get("N"), Some(&RowValues::Int(2)));
    }
}
