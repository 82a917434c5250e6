//! Splits command text into statements and rewrites `:name` parameters to
//! positional `$k` placeholders.

use std::collections::HashMap;
use std::fmt::Write as _;

mod parsers;
mod scanner;

use parsers::NameLookup;
use scanner::{Action, ParamState, ScanState};

use crate::error::PqMiddlewareError;

/// Statements produced by [`parse_statements`], in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStatements {
    statements: Vec<String>,
    parameter_order: Vec<usize>,
}

impl ParsedStatements {
    /// Wrap statements that need no parameter reordering.
    #[must_use]
    pub fn from_statements(statements: Vec<String>) -> Self {
        Self {
            statements,
            parameter_order: Vec::new(),
        }
    }

    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    #[must_use]
    pub fn into_statements(self) -> Vec<String> {
        self.statements
    }

    /// For each placeholder `$k`, the bound-name position it stands for
    /// (`parameter_order()[k - 1]`).
    #[must_use]
    pub fn parameter_order(&self) -> &[usize] {
        &self.parameter_order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

struct Rewriter<'a> {
    lookup: &'a NameLookup,
    numbers: HashMap<usize, usize>,
    order: Vec<usize>,
}

impl Rewriter<'_> {
    fn placeholder(&mut self, name: &str, out: &mut String) -> Result<(), PqMiddlewareError> {
        let pos = self
            .lookup
            .position(name)
            .ok_or_else(|| PqMiddlewareError::BindingError(format!(":{name}")))?;
        let order = &mut self.order;
        let k = *self.numbers.entry(pos).or_insert_with(|| {
            order.push(pos);
            order.len()
        });
        let _ = write!(out, "${k}");
        Ok(())
    }
}

fn flush(current: &mut String, statements: &mut Vec<String>) {
    let statement = current.trim_start();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Split `text` on unquoted `;` and replace every `:name` with `$k`, where `k`
/// numbers distinct names by first appearance across the whole text.
///
/// Text inside `'...'`, `"..."` and `$$...$$` is copied verbatim, as are
/// `::` casts, `:=` and existing `$n` placeholders. Comments get no special
/// treatment: a `;` inside `--` or `/* */` still ends a statement. Empty
/// statements are dropped.
///
/// ```rust
/// use pq_middleware::translation::parse_statements;
///
/// let parsed = parse_statements("insert into t values (:a, :b); select :B::int", &[":a", ":b"])?;
/// assert_eq!(
///     parsed.statements(),
///     ["insert into t values ($1, $2)", "select $2::int"]
/// );
/// # Ok::<(), pq_middleware::PqMiddlewareError>(())
/// ```
///
/// # Errors
/// Returns `PqMiddlewareError::BindingError` naming the first parameter that is
/// not in `bound_names`; no statements are returned in that case.
pub fn parse_statements<S: AsRef<str>>(
    text: &str,
    bound_names: &[S],
) -> Result<ParsedStatements, PqMiddlewareError> {
    let lookup = NameLookup::new(bound_names);
    let mut rewriter = Rewriter {
        lookup: &lookup,
        numbers: HashMap::new(),
        order: Vec::new(),
    };
    let statements = scan_statements(text, |name, out| rewriter.placeholder(name, out))?;

    Ok(ParsedStatements {
        statements,
        parameter_order: rewriter.order,
    })
}

/// Split `text` into statements the same way [`parse_statements`] does, but
/// leave every `:name` as written.
pub(crate) fn split_statements(text: &str) -> Vec<String> {
    scan_statements(text, |name, out| {
        out.push(':');
        out.push_str(name);
        Ok(())
    })
    .unwrap_or_default()
}

fn scan_statements<F>(text: &str, mut on_name: F) -> Result<Vec<String>, PqMiddlewareError>
where
    F: FnMut(&str, &mut String) -> Result<(), PqMiddlewareError>,
{
    let mut scan = ScanState::default();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut name = String::new();

    for c in text.trim().chars() {
        let mut action = scan.step(c);
        loop {
            match action {
                Action::Copy => current.push(c),
                Action::Hold => {}
                Action::Cast => {
                    current.push(':');
                    current.push(c);
                }
                Action::Name => name.push(c),
                Action::EndName => {
                    on_name(&name, &mut current)?;
                    name.clear();
                    action = scan.step(c);
                    continue;
                }
                Action::Release => {
                    current.push(':');
                    action = scan.step(c);
                    continue;
                }
                Action::Separator => flush(&mut current, &mut statements),
            }
            break;
        }
    }

    match scan.param {
        ParamState::AwaitingStart => current.push(':'),
        ParamState::InName => on_name(&name, &mut current)?,
        ParamState::Idle => {}
    }
    flush(&mut current, &mut statements);
    Ok(statements)
}
