use std::fmt;

use thiserror::Error;

/// Server-side error report attached to a failed statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// `ERROR`, `FATAL`, `PANIC`, ...
    pub severity: String,
    /// Five-character SQLSTATE code.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl Diagnostics {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " (detail: {detail})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PqMiddlewareError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Binding error: no bound parameter named {0}")]
    BindingError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Query error: {0}")]
    QueryError(Diagnostics),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl PqMiddlewareError {
    /// Server diagnostics when this is a [`PqMiddlewareError::QueryError`].
    #[must_use]
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            PqMiddlewareError::QueryError(diag) => Some(diag),
            _ => None,
        }
    }

    /// SQLSTATE code of a query error, if any.
    #[must_use]
    pub fn sql_state(&self) -> Option<&str> {
        self.diagnostics().map(|diag| diag.code.as_str())
    }
}
