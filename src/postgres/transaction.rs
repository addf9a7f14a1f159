use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use deadpool_postgres::Object;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard};

use crate::context::Context;
use crate::error::{StoreError, normalize_postgres};
use crate::relational::{Conn, ExecResult, Row, Tx};
use crate::types::RowValues;

use super::query::{FailureMark, PgRows, execute_on, first_row, stream_on};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl TxState {
    fn closed_label(self) -> Option<&'static str> {
        match self {
            TxState::Active => None,
            TxState::Committed => Some("committed"),
            TxState::RolledBack => Some("rolled back"),
        }
    }
}

struct TxInner {
    /// Shared by the root transaction and every savepoint opened inside it.
    /// `None` once the root has been finalized and the connection released.
    conn: Arc<Mutex<Option<Object>>>,
    savepoint: Option<String>,
    state: StdMutex<TxState>,
    parent: Option<PgTx>,
    savepoint_seq: Arc<AtomicUsize>,
    failure: FailureMark,
}

impl std::fmt::Debug for TxInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxInner")
            .field("savepoint", &self.savepoint)
            .field("state", &self.state)
            .field("nested", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

/// A Postgres transaction bound to one pooled connection.
///
/// Calling [`Conn::begin`] on an open transaction creates a savepoint that
/// behaves as a nested transaction. Clones share state, but a transaction must
/// still be driven by one caller at a time.
#[derive(Debug, Clone)]
pub struct PgTx {
    inner: Arc<TxInner>,
}

impl PgTx {
    pub(crate) async fn begin_root(ctx: &Context, conn: Object) -> Result<Self, StoreError> {
        ctx.run(async {
            conn.simple_query("BEGIN")
                .await
                .map_err(normalize_postgres)
        })
        .await?;
        tracing::debug!("postgres transaction started");
        Ok(Self {
            inner: Arc::new(TxInner {
                conn: Arc::new(Mutex::new(Some(conn))),
                savepoint: None,
                state: StdMutex::new(TxState::Active),
                parent: None,
                savepoint_seq: Arc::new(AtomicUsize::new(0)),
                failure: FailureMark::default(),
            }),
        })
    }

    /// Savepoint name when this is a nested transaction.
    #[must_use]
    pub fn savepoint(&self) -> Option<&str> {
        self.inner.savepoint.as_deref()
    }

    fn state(&self) -> TxState {
        self.inner
            .state
            .lock()
            .map_or(TxState::RolledBack, |state| *state)
    }

    /// Label of the first finalized transaction on the path to the root.
    fn closed_label(&self) -> Option<&'static str> {
        self.state()
            .closed_label()
            .or_else(|| self.inner.parent.as_ref().and_then(PgTx::closed_label))
    }

    /// Move to a terminal state exactly once.
    fn claim(&self, next: TxState) -> Result<(), StoreError> {
        if let Some(label) = self.closed_label() {
            return Err(StoreError::TxClosed(label));
        }
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| StoreError::Other("transaction state poisoned".to_string()))?;
        if let Some(label) = state.closed_label() {
            return Err(StoreError::TxClosed(label));
        }
        *state = next;
        Ok(())
    }

    fn set_state(&self, next: TxState) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = next;
        }
    }

    /// Lock the shared connection, failing if this transaction is finished.
    async fn active_conn(&self) -> Result<MutexGuard<'_, Option<Object>>, StoreError> {
        if let Some(label) = self.closed_label() {
            return Err(StoreError::TxClosed(label));
        }
        let guard = self.inner.conn.lock().await;
        if guard.is_none() {
            return Err(StoreError::TxClosed(
                self.closed_label().unwrap_or("finished"),
            ));
        }
        Ok(guard)
    }

    async fn finish(&self, ctx: &Context, next: TxState) -> Result<(), StoreError> {
        self.claim(next)?;
        match &self.inner.savepoint {
            Some(name) => self.finish_savepoint(ctx, name, next).await,
            None => self.finish_root(ctx, next).await,
        }
    }

    async fn finish_root(&self, ctx: &Context, next: TxState) -> Result<(), StoreError> {
        let Some(conn) = self.inner.conn.lock().await.take() else {
            return Err(StoreError::TxClosed("finished"));
        };
        // The server would roll back an aborted transaction on COMMIT anyway.
        let aborted = match next {
            TxState::Committed => self.inner.failure.first(),
            _ => None,
        };
        let sql = if next == TxState::Committed && aborted.is_none() {
            "COMMIT"
        } else {
            "ROLLBACK"
        };
        let res = ctx
            .run(async { conn.simple_query(sql).await.map_err(normalize_postgres) })
            .await;
        match (res, aborted) {
            (Ok(_), None) => {
                tracing::debug!(action = sql, "postgres transaction finished");
                Ok(())
            }
            (Ok(_), Some(first)) => {
                tracing::debug!(cause = %first, "commit refused, postgres transaction rolled back");
                self.set_state(TxState::RolledBack);
                Err(StoreError::TxAborted(first))
            }
            (Err(err), _) => {
                tracing::debug!(action = sql, error = %err, "postgres transaction finish failed");
                self.set_state(TxState::RolledBack);
                release_with_rollback(conn);
                Err(err)
            }
        }
    }

    /// Pass a statement outcome through, remembering the first failure.
    fn track<T>(&self, res: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(err) = &res {
            self.inner.failure.record(err);
        }
        res
    }

    async fn finish_savepoint(
        &self,
        ctx: &Context,
        name: &str,
        next: TxState,
    ) -> Result<(), StoreError> {
        let guard = self.inner.conn.lock().await;
        let Some(conn) = guard.as_ref() else {
            return Err(StoreError::TxClosed("finished"));
        };
        let sql = if next == TxState::Committed {
            format!("RELEASE SAVEPOINT {name}")
        } else {
            format!("ROLLBACK TO SAVEPOINT {name}")
        };
        let res = ctx
            .run(async { conn.simple_query(&sql).await.map_err(normalize_postgres) })
            .await;
        self.track(res)?;
        if next == TxState::RolledBack {
            // Rolling back to a savepoint clears an aborted transaction.
            self.inner.failure.clear();
        }
        tracing::debug!(savepoint = name, action = %sql, "postgres savepoint finished");
        Ok(())
    }
}

#[async_trait]
impl Conn for PgTx {
    type Rows = PgRows;
    type Tx = PgTx;

    async fn execute(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<ExecResult, StoreError> {
        let guard = self.active_conn().await?;
        match guard.as_ref() {
            Some(conn) => self.track(execute_on(ctx, conn, statement, args).await),
            None => Err(StoreError::TxClosed("finished")),
        }
    }

    async fn query(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<PgRows, StoreError> {
        let guard = self.active_conn().await?;
        let Some(conn) = guard.as_ref() else {
            return Err(StoreError::TxClosed("finished"));
        };
        let (columns, stream) = self.track(stream_on(ctx, conn, statement, args).await)?;
        Ok(PgRows::new(columns, stream, None).marking(self.inner.failure.clone()))
    }

    async fn query_row(&self, ctx: &Context, statement: &str, args: &[RowValues]) -> Row {
        match self.query(ctx, statement, args).await {
            Ok(rows) => first_row(ctx, rows).await,
            Err(err) => Row::failed(err),
        }
    }

    async fn begin(&self, ctx: &Context) -> Result<PgTx, StoreError> {
        let guard = self.active_conn().await?;
        let Some(conn) = guard.as_ref() else {
            return Err(StoreError::TxClosed("finished"));
        };
        let seq = self.inner.savepoint_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("sp_{seq}");
        let res = ctx
            .run(async {
                conn.simple_query(&format!("SAVEPOINT {name}"))
                    .await
                    .map_err(normalize_postgres)
            })
            .await;
        self.track(res)?;
        drop(guard);
        tracing::debug!(savepoint = %name, "postgres savepoint started");
        Ok(PgTx {
            inner: Arc::new(TxInner {
                conn: Arc::clone(&self.inner.conn),
                savepoint: Some(name),
                state: StdMutex::new(TxState::Active),
                parent: Some(self.clone()),
                savepoint_seq: Arc::clone(&self.inner.savepoint_seq),
                failure: self.inner.failure.clone(),
            }),
        })
    }
}

#[async_trait]
impl Tx for PgTx {
    async fn commit(&self, ctx: &Context) -> Result<(), StoreError> {
        self.finish(ctx, TxState::Committed).await
    }

    async fn rollback(&self, ctx: &Context) -> Result<(), StoreError> {
        self.finish(ctx, TxState::RolledBack).await
    }

    fn is_finished(&self) -> bool {
        self.closed_label().is_some()
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        // Savepoints left open are folded into the enclosing transaction.
        if self.savepoint.is_some() {
            return;
        }
        let active = self
            .state
            .lock()
            .is_ok_and(|state| *state == TxState::Active);
        if !active {
            return;
        }
        let Ok(mut guard) = self.conn.try_lock() else {
            return;
        };
        if let Some(conn) = guard.take() {
            tracing::debug!("postgres transaction dropped while active; rolling back");
            release_with_rollback(conn);
        }
    }
}

/// Roll back whatever is open on `conn` before it returns to the pool.
///
/// Without a runtime, or if the rollback fails, the connection is detached from
/// the pool and closed so an open transaction is never handed out again.
fn release_with_rollback(conn: Object) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = conn.simple_query("ROLLBACK").await {
                    tracing::debug!(error = %err, "rollback on release failed; closing connection");
                    drop(Object::take(conn));
                }
            });
        }
        Err(_) => {
            tracing::debug!("no runtime to roll back on; closing connection");
            drop(Object::take(conn));
        }
    }
}
