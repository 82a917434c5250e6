//! Commands: statement text plus bound parameters, executed on any native
//! connection.

use crate::error::PqMiddlewareError;
use crate::native::NativeConnection;
use crate::params::{ParameterBuffer, ParameterSet};
use crate::reader::ResultStream;
use crate::translation::{ParsedStatements, parse_statements};
use crate::types::RowValues;

/// How [`Command::text`] is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandType {
    /// One or more `;`-separated statements with `:name` parameters.
    #[default]
    Text,
    /// A function name, called with every input parameter in bind order.
    StoredProcedure,
    /// A table name; reads every row.
    TableDirect,
}

#[derive(Debug, Clone, Default)]
pub struct Command {
    text: String,
    command_type: CommandType,
    parameters: ParameterSet,
}

impl Command {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command_type: CommandType::Text,
            parameters: ParameterSet::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, command_type: CommandType) -> Self {
        self.command_type = command_type;
        self
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    #[must_use]
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    /// Bind `value` to `name`, replacing the value if the name is already bound.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ParameterError` for an empty or quoted name.
    pub fn bind(
        &mut self,
        name: &str,
        value: impl Into<RowValues>,
    ) -> Result<&mut Self, PqMiddlewareError> {
        let value = value.into();
        if self.parameters.get(name).is_some() {
            self.parameters.set_value(name, value)?;
        } else {
            self.parameters.add(name, value)?;
        }
        Ok(self)
    }

    /// The statements this command sends, with placeholders already numbered.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::BindingError` when text references an
    /// unbound name, `PqMiddlewareError::InvalidOperation` for an empty
    /// procedure or table name.
    pub fn parse(&self) -> Result<ParsedStatements, PqMiddlewareError> {
        match self.command_type {
            CommandType::Text => parse_statements(&self.text, &self.parameters.input_names()),
            CommandType::StoredProcedure => {
                let name = self.object_name()?;
                let placeholders = (1..=self.parameters.inputs().count())
                    .map(|n| format!("${n}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(ParsedStatements::from_statements(vec![format!(
                    "SELECT * FROM {name}({placeholders})"
                )]))
            }
            CommandType::TableDirect => {
                let name = self.object_name()?;
                Ok(ParsedStatements::from_statements(vec![format!(
                    "TABLE {name}"
                )]))
            }
        }
    }

    fn object_name(&self) -> Result<&str, PqMiddlewareError> {
        let name = self.text.trim();
        if name.is_empty() {
            return Err(PqMiddlewareError::InvalidOperation(format!(
                "{:?} command needs an object name",
                self.command_type
            )));
        }
        Ok(name)
    }

    fn prepare(&mut self) -> Result<(Vec<String>, ParameterBuffer), PqMiddlewareError> {
        let parsed = self.parse()?;
        let buffer = self.parameters.buffer()?;
        let buffer = if parsed.parameter_order().is_empty() {
            buffer.clone()
        } else {
            buffer.reordered(parsed.parameter_order())
        };
        Ok((parsed.into_statements(), buffer))
    }

    /// Start executing on `conn`. The first statement is already dispatched
    /// when this returns; its errors surface here.
    ///
    /// # Errors
    /// Parsing and encoding errors, then anything
    /// [`ResultStream::next_statement`] returns for the first statement.
    pub async fn execute_reader<'c, C: NativeConnection>(
        &mut self,
        conn: &'c mut C,
    ) -> Result<ResultStream<'c, C>, PqMiddlewareError> {
        let (statements, buffer) = self.prepare()?;
        let mut stream = ResultStream::new(conn, statements, buffer);
        stream.next_statement().await?;
        Ok(stream)
    }

    /// Run every statement and return the summed affected-row counts.
    /// Output parameters are filled from the first row any statement returns.
    ///
    /// # Errors
    /// The first error any statement raises; later statements are not run.
    pub async fn execute_non_query<C: NativeConnection>(
        &mut self,
        conn: &mut C,
    ) -> Result<u64, PqMiddlewareError> {
        let mut stream = self.execute_reader(conn).await?;
        let mut total = 0;
        let mut outputs_applied = false;
        loop {
            while stream.advance().await? {
                if !outputs_applied {
                    let row = stream.current_row()?;
                    self.parameters.apply_outputs(&row);
                    outputs_applied = true;
                }
            }
            total += stream.records_affected().unwrap_or(0);
            if !stream.next_statement().await? {
                break;
            }
        }
        Ok(total)
    }

    /// First column of the first row, or `None` when there are no rows. The
    /// rest of the batch is drained.
    ///
    /// # Errors
    /// Same as [`Command::execute_reader`], plus decode errors for the value.
    pub async fn execute_scalar<C: NativeConnection>(
        &mut self,
        conn: &mut C,
    ) -> Result<Option<RowValues>, PqMiddlewareError> {
        let mut stream = self.execute_reader(conn).await?;
        let value = if stream.advance().await? && stream.field_count() > 0 {
            Some(stream.value(0)?)
        } else {
            None
        };
        stream.close().await;
        Ok(value)
    }
}
