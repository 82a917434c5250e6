//! Named parameters bound to a command and their encoded wire form.

mod buffer;
mod parameter;

use std::collections::HashMap;

use tokio_postgres::types::Type;

pub use buffer::ParameterBuffer;
pub use parameter::{BoundParameter, canonical_name};

use crate::error::PqMiddlewareError;
use crate::results::CustomDbRow;
use crate::types::RowValues;

/// The parameters of one command, in bind order.
///
/// Input and input-output parameters are encoded into a [`ParameterBuffer`]
/// in the order they were added; output parameters are never sent and are
/// filled from the first result row instead.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<BoundParameter>,
    index: HashMap<String, usize>,
    cached: Option<ParameterBuffer>,
}

impl ParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an input parameter; its type is inferred from the value.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or duplicate name.
    pub fn add(
        &mut self,
        name: &str,
        value: impl Into<RowValues>,
    ) -> Result<&mut BoundParameter, PqMiddlewareError> {
        self.add_parameter(BoundParameter::new(name, value)?)
    }

    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or duplicate name.
    pub fn add_typed(
        &mut self,
        name: &str,
        db_type: Type,
        value: impl Into<RowValues>,
    ) -> Result<&mut BoundParameter, PqMiddlewareError> {
        self.add_parameter(BoundParameter::typed(name, db_type, value)?)
    }

    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or duplicate name.
    pub fn add_output(
        &mut self,
        name: &str,
        db_type: Type,
    ) -> Result<&mut BoundParameter, PqMiddlewareError> {
        self.add_parameter(BoundParameter::output(name, db_type)?)
    }

    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` when the name is already bound.
    pub fn add_parameter(
        &mut self,
        param: BoundParameter,
    ) -> Result<&mut BoundParameter, PqMiddlewareError> {
        if self.index.contains_key(param.name()) {
            return Err(PqMiddlewareError::ParameterError(format!(
                "parameter {} is already bound",
                param.name()
            )));
        }
        self.cached = None;
        let pos = self.params.len();
        self.index.insert(param.name().to_string(), pos);
        self.params.push(param);
        Ok(&mut self.params[pos])
    }

    /// Look up by any spelling that canonicalizes to the bound name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BoundParameter> {
        let key = canonical_name(name).ok()?;
        self.index.get(&key).map(|&pos| &self.params[pos])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BoundParameter> {
        let key = canonical_name(name).ok()?;
        let pos = *self.index.get(&key)?;
        self.cached = None;
        Some(&mut self.params[pos])
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&RowValues> {
        self.get(name).map(BoundParameter::value)
    }

    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` when no such parameter is bound.
    pub fn set_value(
        &mut self,
        name: &str,
        value: impl Into<RowValues>,
    ) -> Result<(), PqMiddlewareError> {
        let param = self
            .get_mut(name)
            .ok_or_else(|| PqMiddlewareError::ParameterError(format!("no parameter {name}")))?;
        param.set_value(value);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.params.clear();
        self.index.clear();
        self.cached = None;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundParameter> {
        self.params.iter()
    }

    /// Inputs in buffer order.
    pub fn inputs(&self) -> impl Iterator<Item = &BoundParameter> {
        self.params.iter().filter(|p| p.direction().is_sent())
    }

    /// Canonical names of the parameters that travel to the server, in buffer
    /// order. This is the name list statement parsing resolves against.
    #[must_use]
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs().map(BoundParameter::name).collect()
    }

    /// Encode the inputs. The result is cached until the set changes.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` when a value does not fit its
    /// declared type.
    pub fn buffer(&mut self) -> Result<&ParameterBuffer, PqMiddlewareError> {
        if self.cached.is_none() {
            let mut buf = ParameterBuffer::new();
            for param in self.inputs() {
                let (ty, bytes) = param.encode()?;
                buf.push(ty, bytes);
            }
            self.cached = Some(buf);
        }
        self.cached
            .as_ref()
            .ok_or_else(|| PqMiddlewareError::ParameterError("parameter buffer unavailable".into()))
    }

    /// Copy matching columns of `row` into output and input-output parameters.
    /// Returns how many parameters were updated.
    pub fn apply_outputs(&mut self, row: &CustomDbRow) -> usize {
        let mut updated = 0;
        for param in &mut self.params {
            if !param.direction().receives_output() {
                continue;
            }
            let bare = param.name().trim_start_matches(':');
            let column = row
                .column_names
                .iter()
                .position(|col| col.eq_ignore_ascii_case(bare));
            if let Some(value) = column.and_then(|idx| row.get_by_index(idx)) {
                param.set_value(value.clone());
                updated += 1;
            }
        }
        if updated > 0 {
            self.cached = None;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut set = ParameterSet::new();
        set.add("a", 1).unwrap();
        let err = set.add(":A", 2).unwrap_err();
        assert!(matches!(err, PqMiddlewareError::ParameterError(_)));
    }

    #[test]
    fn outputs_are_left_out_of_the_buffer() {
        let mut set = ParameterSet::new();
        set.add("a", 1).unwrap();
        set.add_output("out", Type::INT8).unwrap();
        set.add("b", "x").unwrap();
        assert_eq!(set.input_names(), vec![":a", ":b"]);
        let buf = set.buffer().unwrap();
        assert_eq!(buf.types(), &[Type::INT8, Type::TEXT]);
    }

    #[test]
    fn buffer_is_rebuilt_after_mutation() {
        let mut set = ParameterSet::new();
        set.add("a", 1).unwrap();
        assert_eq!(set.buffer().unwrap().len(), 1);
        set.set_value("A", "now text").unwrap();
        assert_eq!(set.buffer().unwrap().types(), &[Type::TEXT]);
    }

    #[test]
    fn outputs_take_first_row_values() {
        let mut set = ParameterSet::new();
        set.add_output("Total", Type::INT8).unwrap();
        set.add("id", 3).unwrap();
        let row = CustomDbRow::new(
            Arc::new(vec!["total".into(), "id".into()]),
            vec![RowValues::Int(99), RowValues::Int(3)],
        );
        assert_eq!(set.apply_outputs(&row), 1);
        assert_eq!(set.value("total"), Some(&RowValues::Int(99)));
    }
}
