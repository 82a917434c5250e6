//! Helper utilities for testing and development.

use std::sync::Arc;

use crate::config::PoolKey;
use crate::results::CustomDbRow;
use crate::types::RowValues;

/// Create a test row with the given column names and values.
#[must_use]
pub fn create_test_row(column_names: Vec<String>, values: Vec<RowValues>) -> CustomDbRow {
    CustomDbRow::new(Arc::new(column_names), values)
}

/// A descriptor for a fictional database, distinct per `dbname`.
#[must_use]
pub fn test_key(dbname: &str) -> PoolKey {
    PoolKey::from_pairs([("host", "localhost"), ("user", "tester"), ("dbname", dbname)])
        .unwrap_or_default()
}
