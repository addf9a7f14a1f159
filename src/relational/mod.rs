//! Backend-agnostic relational contracts.
//!
//! Call sites depend on [`Conn`], [`Tx`] and [`Rows`]; the Postgres backend in
//! [`crate::postgres`] is one implementation. Statements are raw parameterized
//! strings with positional [`RowValues`] arguments.

mod dest;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::StoreError;
use crate::types::RowValues;

pub use dest::{FromRowValue, ScanDest};

/// Leading keyword of an executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Insert,
    Select,
    Update,
    Delete,
    Other,
}

impl CommandKind {
    /// Classify a statement by its first keyword, skipping whitespace and comments.
    #[must_use]
    pub fn from_statement(statement: &str) -> Self {
        let keyword = leading_keyword(statement);
        if keyword.eq_ignore_ascii_case("insert") {
            CommandKind::Insert
        } else if keyword.eq_ignore_ascii_case("select") {
            CommandKind::Select
        } else if keyword.eq_ignore_ascii_case("update") {
            CommandKind::Update
        } else if keyword.eq_ignore_ascii_case("delete") {
            CommandKind::Delete
        } else {
            CommandKind::Other
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Insert => "INSERT",
            CommandKind::Select => "SELECT",
            CommandKind::Update => "UPDATE",
            CommandKind::Delete => "DELETE",
            CommandKind::Other => "OTHER",
        }
    }
}

fn leading_keyword(statement: &str) -> &str {
    let mut rest = statement;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Outcome of a non-row-returning statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    command: CommandKind,
    rows_affected: u64,
}

impl ExecResult {
    #[must_use]
    pub fn new(statement: &str, rows_affected: u64) -> Self {
        Self {
            command: CommandKind::from_statement(statement),
            rows_affected,
        }
    }

    #[must_use]
    pub fn command(&self) -> CommandKind {
        self.command
    }

    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.command == CommandKind::Insert
    }

    #[must_use]
    pub fn is_select(&self) -> bool {
        self.command == CommandKind::Select
    }

    #[must_use]
    pub fn is_update(&self) -> bool {
        self.command == CommandKind::Update
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.command == CommandKind::Delete
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command.as_str(), self.rows_affected)
    }
}

/// Result of a single-row query.
///
/// Any failure, including "no row matched", is deferred until [`Row::scan`] so the
/// outcome does not depend on the destination type.
#[derive(Debug)]
pub struct Row {
    outcome: Result<Option<(Arc<Vec<String>>, Vec<RowValues>)>, StoreError>,
}

impl Row {
    pub(crate) fn found(columns: Arc<Vec<String>>, values: Vec<RowValues>) -> Self {
        Self {
            outcome: Ok(Some((columns, values))),
        }
    }

    pub(crate) fn empty() -> Self {
        Self { outcome: Ok(None) }
    }

    pub(crate) fn failed(err: StoreError) -> Self {
        Self { outcome: Err(err) }
    }

    /// Scan the row into a typed destination.
    ///
    /// # Errors
    /// Returns the canonical `NoRows` error when nothing matched, the query's own
    /// error if it failed, or `StoreError::ScanError` on an arity/type mismatch.
    pub fn scan<D: ScanDest>(self) -> Result<D, StoreError> {
        let values = self.into_values()?;
        D::scan_from(&values)
    }

    /// Take the raw column values.
    ///
    /// # Errors
    /// Same as [`Row::scan`], minus destination mismatches.
    pub fn into_values(self) -> Result<Vec<RowValues>, StoreError> {
        match self.outcome {
            Ok(Some((_, values))) => Ok(values),
            Ok(None) => Err(StoreError::no_rows()),
            Err(err) => Err(err),
        }
    }

    /// Column names, when a row was found.
    #[must_use]
    pub fn columns(&self) -> Option<&[String]> {
        match &self.outcome {
            Ok(Some((columns, _))) => Some(columns.as_slice()),
            _ => None,
        }
    }
}

/// Forward-only cursor over a multi-row result.
///
/// The error is sticky: once `next` returns `false`, check [`Rows::err`] to tell
/// exhaustion from failure. `close` must be reachable on every exit path and is
/// idempotent; dropping the cursor closes it too.
#[async_trait]
pub trait Rows: Send {
    /// Advance to the next row. Returns `false` at the end or on error.
    async fn next(&mut self, ctx: &Context) -> bool;

    /// Values of the current row.
    ///
    /// # Errors
    /// Returns `StoreError::ScanError` if there is no current row.
    fn values(&self) -> Result<&[RowValues], StoreError>;

    fn columns(&self) -> &[String];

    fn err(&self) -> Option<&StoreError>;

    fn close(&mut self);

    /// Scan the current row into a typed destination.
    ///
    /// # Errors
    /// Returns `StoreError::ScanError` on an arity/type mismatch or with no current row.
    fn scan<D: ScanDest>(&self) -> Result<D, StoreError>
    where
        Self: Sized,
    {
        D::scan_from(self.values()?)
    }
}

/// Statement surface shared by plain connections and transactions.
#[async_trait]
pub trait Conn: Send + Sync {
    type Rows: Rows;
    type Tx: Tx;

    /// Run a statement that returns no rows.
    async fn execute(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<ExecResult, StoreError>;

    /// Run a row-returning statement and stream its rows.
    async fn query(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<Self::Rows, StoreError>;

    /// Run a statement and keep only its first row.
    async fn query_row(&self, ctx: &Context, statement: &str, args: &[RowValues]) -> Row;

    /// Open a transaction scoped to this connection.
    async fn begin(&self, ctx: &Context) -> Result<Self::Tx, StoreError>;
}

/// A transaction reaches exactly one terminal state. Statements issued after
/// commit or rollback fail with `StoreError::TxClosed`.
#[async_trait]
pub trait Tx: Conn {
    async fn commit(&self, ctx: &Context) -> Result<(), StoreError>;

    async fn rollback(&self, ctx: &Context) -> Result<(), StoreError>;

    /// True once the transaction (or an enclosing one) has been finalized.
    fn is_finished(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn command_kind_reads_leading_keyword() {
        assert_eq!(
            CommandKind::from_statement("INSERT INTO t VALUES ($1)"),
            CommandKind::Insert
        );
        assert_eq!(
            CommandKind::from_statement("\n  update users set name = $1"),
            CommandKind::Update
        );
        assert_eq!(
            CommandKind::from_statement("-- purge\nDELETE FROM sessions"),
            CommandKind::Delete
        );
        assert_eq!(
            CommandKind::from_statement("/* hint */ select 1"),
            CommandKind::Select
        );
        assert_eq!(
            CommandKind::from_statement("CREATE TABLE t (id int)"),
            CommandKind::Other
        );
        assert_eq!(CommandKind::from_statement(""), CommandKind::Other);
    }

    #[test]
    fn exec_result_reports_tag() {
        let res = ExecResult::new("UPDATE users SET name = $1", 3);
        assert!(res.is_update());
        assert!(!res.is_insert());
        assert_eq!(res.rows_affected(), 3);
        assert_eq!(res.to_string(), "UPDATE 3");
    }

    #[test]
    fn empty_row_is_no_rows_for_any_destination() {
        let err = Row::empty().scan::<(i64,)>().unwrap_err();
        assert!(err.is(ErrorKind::NoRows));

        let err = Row::empty().scan::<(String, bool, Option<f64>)>().unwrap_err();
        assert!(err.is(ErrorKind::NoRows));

        let err = Row::empty().scan::<Vec<RowValues>>().unwrap_err();
        assert!(err.is(ErrorKind::NoRows));
    }

    #[test]
    fn failed_row_surfaces_its_own_error() {
        let err = Row::failed(StoreError::Cancelled)
            .scan::<(i64,)>()
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[test]
    fn found_row_scans_into_tuple() {
        let columns = Arc::new(vec!["id".to_string(), "name".to_string()]);
        let row = Row::found(
            columns,
            vec![RowValues::Int(7), RowValues::Text("alice".into())],
        );
        assert_eq!(row.columns().unwrap(), ["id", "name"]);
        let (id, name): (i64, String) = row.scan().unwrap();
        assert_eq!(id, 7);
        assert_eq!(name, "alice");
    }
}
