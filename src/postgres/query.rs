use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::Object;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_postgres::RowStream;
use tokio_postgres::types::Type;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{StoreError, normalize_postgres};
use crate::relational::{ExecResult, Row, Rows};
use crate::types::RowValues;

use super::params::Params;

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
///
/// # Errors
/// Returns `StoreError` if the column cannot be decoded.
pub fn postgres_extract_value(
    row: &tokio_postgres::Row,
    idx: usize,
) -> Result<RowValues, StoreError> {
    let type_info = row.columns()[idx].type_();

    let value = match *type_info {
        Type::INT2 => {
            let val: Option<i16> = row.try_get(idx)?;
            val.map(|v| RowValues::Int(i64::from(v)))
        }
        Type::INT4 => {
            let val: Option<i32> = row.try_get(idx)?;
            val.map(|v| RowValues::Int(i64::from(v)))
        }
        Type::INT8 => {
            let val: Option<i64> = row.try_get(idx)?;
            val.map(RowValues::Int)
        }
        Type::FLOAT4 => {
            let val: Option<f32> = row.try_get(idx)?;
            val.map(|v| RowValues::Float(f64::from(v)))
        }
        Type::FLOAT8 => {
            let val: Option<f64> = row.try_get(idx)?;
            val.map(RowValues::Float)
        }
        Type::BOOL => {
            let val: Option<bool> = row.try_get(idx)?;
            val.map(RowValues::Bool)
        }
        Type::TIMESTAMP => {
            let val: Option<NaiveDateTime> = row.try_get(idx)?;
            val.map(RowValues::Timestamp)
        }
        Type::TIMESTAMPTZ => {
            let val: Option<DateTime<Utc>> = row.try_get(idx)?;
            val.map(|v| RowValues::Timestamp(v.naive_utc()))
        }
        Type::UUID => {
            let val: Option<Uuid> = row.try_get(idx)?;
            val.map(|v| RowValues::Text(v.to_string()))
        }
        Type::JSON | Type::JSONB => {
            let val: Option<Value> = row.try_get(idx)?;
            val.map(RowValues::JSON)
        }
        Type::BYTEA => {
            let val: Option<Vec<u8>> = row.try_get(idx)?;
            val.map(RowValues::Blob)
        }
        // Text-like and anything else the driver can hand back as a string.
        _ => {
            let val: Option<String> = row.try_get(idx)?;
            val.map(RowValues::Text)
        }
    };
    Ok(value.unwrap_or(RowValues::Null))
}

fn extract_row(row: &tokio_postgres::Row) -> Result<Vec<RowValues>, StoreError> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        values.push(postgres_extract_value(row, idx)?);
    }
    Ok(values)
}

/// Statement text on one line, for log fields.
pub(crate) fn inline_statement(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn log_outcome<T>(
    op: &'static str,
    statement: &str,
    started: Instant,
    res: &Result<T, StoreError>,
) {
    let duration = started.elapsed();
    match res {
        Ok(_) => tracing::debug!(op, sql = %inline_statement(statement), ?duration, "statement ok"),
        Err(err) if err.kind().is_some() || err.is_cancellation() => {
            tracing::debug!(op, sql = %inline_statement(statement), ?duration, error = %err, "statement failed");
        }
        Err(err) => {
            tracing::error!(op, sql = %inline_statement(statement), ?duration, error = %err, "statement failed");
        }
    }
}

/// Run a non-row-returning statement on `conn`.
pub(crate) async fn execute_on(
    ctx: &Context,
    conn: &Object,
    statement: &str,
    args: &[RowValues],
) -> Result<ExecResult, StoreError> {
    let started = Instant::now();
    let res = ctx
        .run(async {
            let params = Params::convert(args);
            conn.execute(statement, params.as_refs())
                .await
                .map_err(normalize_postgres)
        })
        .await
        .map(|rows| ExecResult::new(statement, rows));
    log_outcome("execute", statement, started, &res);
    res
}

/// Start streaming a statement's rows from `conn`.
///
/// The returned stream does not borrow `conn`; whoever owns the connection must
/// keep it alive until the stream is finished.
pub(crate) async fn stream_on(
    ctx: &Context,
    conn: &Object,
    statement: &str,
    args: &[RowValues],
) -> Result<(Arc<Vec<String>>, Pin<Box<RowStream>>), StoreError> {
    let started = Instant::now();
    let res = ctx
        .run(async {
            let stmt = conn
                .prepare_cached(statement)
                .await
                .map_err(normalize_postgres)?;
            let columns: Vec<String> = stmt
                .columns()
                .iter()
                .map(|col| col.name().to_string())
                .collect();
            let stream = conn
                .query_raw(&stmt, args.iter())
                .await
                .map_err(normalize_postgres)?;
            Ok::<_, StoreError>((Arc::new(columns), Box::pin(stream)))
        })
        .await;
    log_outcome("query", statement, started, &res);
    res
}

/// First statement failure on a transaction's connection.
///
/// After a failed statement Postgres rejects everything but a rollback, and
/// turns a later `COMMIT` into `ROLLBACK` without reporting an error.
#[derive(Debug, Clone, Default)]
pub(crate) struct FailureMark(Arc<StdMutex<Option<String>>>);

impl FailureMark {
    pub(crate) fn record(&self, err: &StoreError) {
        if let Ok(mut first) = self.0.lock()
            && first.is_none()
        {
            *first = Some(err.to_string());
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut first) = self.0.lock() {
            *first = None;
        }
    }

    pub(crate) fn first(&self) -> Option<String> {
        self.0.lock().ok().and_then(|first| first.clone())
    }
}

/// Keep only the first row of `rows`, closing it either way.
pub(crate) async fn first_row(ctx: &Context, mut rows: PgRows) -> Row {
    let row = if rows.next(ctx).await {
        match rows.current.take() {
            Some(values) => Row::found(Arc::clone(&rows.columns), values),
            None => Row::empty(),
        }
    } else {
        match rows.err.take() {
            Some(err) => Row::failed(err),
            None => Row::empty(),
        }
    };
    rows.close();
    row
}

/// Streaming cursor over a Postgres result.
///
/// Rows opened on a store hold their pooled connection until closed; rows opened
/// inside a transaction share the transaction's connection.
pub struct PgRows {
    stream: Option<Pin<Box<RowStream>>>,
    columns: Arc<Vec<String>>,
    current: Option<Vec<RowValues>>,
    err: Option<StoreError>,
    conn: Option<Object>,
    failure: Option<FailureMark>,
}

impl PgRows {
    pub(crate) fn new(
        columns: Arc<Vec<String>>,
        stream: Pin<Box<RowStream>>,
        conn: Option<Object>,
    ) -> Self {
        Self {
            stream: Some(stream),
            columns,
            current: None,
            err: None,
            conn,
            failure: None,
        }
    }

    /// Report stream failures to the owning transaction.
    pub(crate) fn marking(mut self, failure: FailureMark) -> Self {
        self.failure = Some(failure);
        self
    }
}

impl std::fmt::Debug for PgRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRows")
            .field("columns", &self.columns)
            .field("open", &self.stream.is_some())
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Rows for PgRows {
    async fn next(&mut self, ctx: &Context) -> bool {
        self.current = None;
        if self.err.is_some() {
            return false;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let step = ctx
            .run(async {
                match stream.next().await {
                    Some(Ok(row)) => extract_row(&row).map(Some),
                    Some(Err(err)) => Err(normalize_postgres(err)),
                    None => Ok(None),
                }
            })
            .await;
        match step {
            Ok(Some(values)) => {
                self.current = Some(values);
                true
            }
            Ok(None) => {
                self.close();
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "row stream failed");
                if let Some(failure) = &self.failure {
                    failure.record(&err);
                }
                self.err = Some(err);
                self.close();
                false
            }
        }
    }

    fn values(&self) -> Result<&[RowValues], StoreError> {
        self.current
            .as_deref()
            .ok_or_else(|| StoreError::ScanError("no current row; call next first".to_string()))
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn err(&self) -> Option<&StoreError> {
        self.err.as_ref()
    }

    fn close(&mut self) {
        self.stream = None;
        self.conn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_mark_keeps_the_first_error() {
        let mark = FailureMark::default();
        let shared = mark.clone();
        assert!(mark.first().is_none());

        shared.record(&StoreError::Other("first".into()));
        mark.record(&StoreError::Other("second".into()));
        assert_eq!(mark.first().as_deref(), Some("Other store error: first"));

        mark.clear();
        assert!(shared.first().is_none());
    }

    #[test]
    fn inline_statement_collapses_whitespace() {
        let sql = "SELECT id,\n       name\n  FROM users\n WHERE id = $1";
        assert_eq!(
            inline_statement(sql),
            "SELECT id, name FROM users WHERE id = $1"
        );
    }
}
