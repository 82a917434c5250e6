use tokio_postgres::types::Type;
use tokio_util::bytes::Bytes;

use crate::codec;
use crate::error::PqMiddlewareError;
use crate::types::{ParameterDirection, RowValues};

const TRIM_START: &[char] = &[' ', ':', '@', '\t', '\n'];

/// Canonical form of a parameter name: `:` followed by the lower-cased name
/// with leading sigils and surrounding whitespace removed.
///
/// # Errors
/// Returns `PqMiddlewareError::ParameterError` for an empty name, or a
/// double-quoted one that command text could never reference.
pub fn canonical_name(raw: &str) -> Result<String, PqMiddlewareError> {
    let name = raw.trim_start_matches(TRIM_START).trim_end().to_lowercase();
    if name.is_empty() || name.starts_with('"') {
        return Err(PqMiddlewareError::ParameterError(format!(
            "invalid parameter name '{raw}'"
        )));
    }
    Ok(format!(":{name}"))
}

/// One named parameter of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    name: String,
    db_type: Option<Type>,
    value: RowValues,
    direction: ParameterDirection,
}

impl BoundParameter {
    /// Input parameter whose wire type is inferred from the value.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or quoted name.
    pub fn new(name: &str, value: impl Into<RowValues>) -> Result<Self, PqMiddlewareError> {
        Ok(Self {
            name: canonical_name(name)?,
            db_type: None,
            value: value.into(),
            direction: ParameterDirection::Input,
        })
    }

    /// Input parameter with a declared wire type.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or quoted name.
    pub fn typed(
        name: &str,
        db_type: Type,
        value: impl Into<RowValues>,
    ) -> Result<Self, PqMiddlewareError> {
        let mut param = Self::new(name, value)?;
        param.db_type = Some(db_type);
        Ok(param)
    }

    /// Output parameter, filled from the first result row.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or quoted name.
    pub fn output(name: &str, db_type: Type) -> Result<Self, PqMiddlewareError> {
        let mut param = Self::typed(name, db_type, RowValues::Null)?;
        param.direction = ParameterDirection::Output;
        Ok(param)
    }

    #[must_use]
    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Canonical name including the leading `:`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn db_type(&self) -> Option<&Type> {
        self.db_type.as_ref()
    }

    #[must_use]
    pub fn value(&self) -> &RowValues {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<RowValues>) {
        self.value = value.into();
    }

    #[must_use]
    pub fn direction(&self) -> ParameterDirection {
        self.direction
    }

    /// Declared type, or the type inferred from the value.
    #[must_use]
    pub fn wire_type(&self) -> Type {
        self.db_type
            .clone()
            .unwrap_or_else(|| codec::infer_type(&self.value))
    }

    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` when the value does not fit
    /// its type.
    pub fn encode(&self) -> Result<(Type, Option<Bytes>), PqMiddlewareError> {
        let ty = self.wire_type();
        let bytes = codec::encode(&self.value, &ty)?;
        Ok((ty, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_canonicalized() {
        assert_eq!(canonical_name(":UserId").unwrap(), ":userid");
        assert_eq!(canonical_name("@ Name \t").unwrap(), ":name");
        assert!(canonical_name("\"Mixed\"").is_err());
        assert!(canonical_name(":\"Mixed\"").is_err());
        assert!(canonical_name(" :").is_err());
    }

    #[test]
    fn untyped_null_travels_as_unknown() {
        let p = BoundParameter::new("x", RowValues::Null).unwrap();
        assert_eq!(p.encode().unwrap(), (Type::UNKNOWN, None));

        let typed = BoundParameter::typed("x", Type::INT4, RowValues::Null).unwrap();
        assert_eq!(typed.encode().unwrap(), (Type::INT4, None));
    }

    #[test]
    fn output_parameters_are_not_sent() {
        let p = BoundParameter::output("total", Type::INT8).unwrap();
        assert!(!p.direction().is_sent());
        assert!(p.direction().receives_output());
    }
}
