use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Values that can be bound as command parameters or read back from a row.
///
/// ```rust
/// use pq_middleware::prelude::*;
///
/// let mut params = ParameterSet::new();
/// params.add("id", RowValues::Int(1))?;
/// params.add("name", RowValues::Text("alice".into()))?;
/// # Ok::<(), PqMiddlewareError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        if let RowValues::Bool(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let RowValues::Timestamp(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&JsonValue> {
        if let RowValues::JSON(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Parse a command-line style literal: integers, floats, `true`/`false`,
    /// `null`, anything else as text.
    #[must_use]
    pub fn from_literal(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("null") {
            RowValues::Null
        } else if let Ok(i) = raw.parse::<i64>() {
            RowValues::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            RowValues::Float(f)
        } else if raw.eq_ignore_ascii_case("true") {
            RowValues::Bool(true)
        } else if raw.eq_ignore_ascii_case("false") {
            RowValues::Bool(false)
        } else {
            RowValues::Text(raw.to_string())
        }
    }
}

impl From<i64> for RowValues {
    fn from(value: i64) -> Self {
        RowValues::Int(value)
    }
}

impl From<i32> for RowValues {
    fn from(value: i32) -> Self {
        RowValues::Int(i64::from(value))
    }
}

impl From<f64> for RowValues {
    fn from(value: f64) -> Self {
        RowValues::Float(value)
    }
}

impl From<bool> for RowValues {
    fn from(value: bool) -> Self {
        RowValues::Bool(value)
    }
}

impl From<&str> for RowValues {
    fn from(value: &str) -> Self {
        RowValues::Text(value.to_string())
    }
}

impl From<String> for RowValues {
    fn from(value: String) -> Self {
        RowValues::Text(value)
    }
}

impl From<NaiveDateTime> for RowValues {
    fn from(value: NaiveDateTime) -> Self {
        RowValues::Timestamp(value)
    }
}

impl From<JsonValue> for RowValues {
    fn from(value: JsonValue) -> Self {
        RowValues::JSON(value)
    }
}

impl From<Vec<u8>> for RowValues {
    fn from(value: Vec<u8>) -> Self {
        RowValues::Blob(value)
    }
}

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// Direction of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterDirection {
    /// Sent to the server.
    #[default]
    Input,
    /// Filled from the command's first result row; never sent.
    Output,
    /// Sent to the server and refreshed from the first result row.
    InputOutput,
}

impl ParameterDirection {
    /// Whether parameters with this direction travel in the wire buffer.
    #[must_use]
    pub fn is_sent(self) -> bool {
        !matches!(self, ParameterDirection::Output)
    }

    #[must_use]
    pub fn receives_output(self) -> bool {
        !matches!(self, ParameterDirection::Input)
    }
}
