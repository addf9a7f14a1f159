//! Transaction-bound repositories.
//!
//! There is no unit-of-work coordinator. A caller begins one transaction, passes
//! the same [`TxHandle`] to every repository that should join it via
//! [`Repository::with_tx`], and finalizes it exactly once. [`run_in_tx`] wraps
//! that pattern.
//!
//! Concrete repositories embed a [`SqlRepository`] or [`CacheRepository`] and
//! use its facade operations directly.

use std::future::Future;

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::StoreError;
use crate::types::BackendKind;

#[cfg(feature = "postgres")]
use crate::postgres::{PgRows, PgStore, PgTx};
#[cfg(feature = "postgres")]
use crate::relational::{Conn, ExecResult, Row, Tx};
#[cfg(feature = "postgres")]
use crate::types::RowValues;

#[cfg(feature = "redis")]
use crate::kv::{Expiration, KvConn, KvTx, KvValue};
#[cfg(feature = "redis")]
use crate::redis::{RedisStore, RedisTx};
#[cfg(feature = "redis")]
use crate::scan::{ScanIterator, Scanner, Scanners};

/// An open transaction of either backend, tagged with its kind.
#[derive(Debug, Clone)]
pub enum TxHandle {
    #[cfg(feature = "postgres")]
    Postgres(PgTx),
    #[cfg(feature = "redis")]
    Redis(RedisTx),
}

impl TxHandle {
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "postgres")]
            TxHandle::Postgres(_) => BackendKind::Postgres,
            #[cfg(feature = "redis")]
            TxHandle::Redis(_) => BackendKind::Redis,
        }
    }

    /// Commit, or for Redis flush the queued pipeline.
    ///
    /// # Errors
    /// Returns the backend error, or `StoreError::TxClosed` if already finalized.
    pub async fn commit(&self, ctx: &Context) -> Result<(), StoreError> {
        match self {
            #[cfg(feature = "postgres")]
            TxHandle::Postgres(tx) => tx.commit(ctx).await,
            #[cfg(feature = "redis")]
            TxHandle::Redis(tx) => tx.exec(ctx).await.map(|_| ()),
        }
    }

    /// Roll back, or for Redis drop the queued pipeline.
    ///
    /// # Errors
    /// Returns the backend error, or `StoreError::TxClosed` if already finalized.
    pub async fn rollback(&self, ctx: &Context) -> Result<(), StoreError> {
        match self {
            #[cfg(feature = "postgres")]
            TxHandle::Postgres(tx) => tx.rollback(ctx).await,
            #[cfg(feature = "redis")]
            TxHandle::Redis(tx) => tx.discard(ctx).await,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            TxHandle::Postgres(tx) => Tx::is_finished(tx),
            #[cfg(feature = "redis")]
            TxHandle::Redis(tx) => KvTx::is_finished(tx),
        }
    }

    #[cfg(feature = "postgres")]
    #[must_use]
    pub fn as_postgres(&self) -> Option<&PgTx> {
        match self {
            TxHandle::Postgres(tx) => Some(tx),
            #[cfg(feature = "redis")]
            TxHandle::Redis(_) => None,
        }
    }

    #[cfg(feature = "redis")]
    #[must_use]
    pub fn as_redis(&self) -> Option<&RedisTx> {
        match self {
            TxHandle::Redis(tx) => Some(tx),
            #[cfg(feature = "postgres")]
            TxHandle::Postgres(_) => None,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<PgTx> for TxHandle {
    fn from(tx: PgTx) -> Self {
        TxHandle::Postgres(tx)
    }
}

#[cfg(feature = "redis")]
impl From<RedisTx> for TxHandle {
    fn from(tx: RedisTx) -> Self {
        TxHandle::Redis(tx)
    }
}

/// A repository that can start a transaction and rebind itself to one.
pub trait Repository: Sized {
    fn backend_kind(&self) -> BackendKind;

    /// Start a transaction on this repository's store.
    fn begin(&self, ctx: &Context) -> impl Future<Output = Result<TxHandle, StoreError>> + Send;

    /// A copy of this repository whose operations run inside `tx`.
    ///
    /// # Errors
    /// Returns `StoreError::BackendMismatch` when `tx` belongs to another backend.
    fn with_tx(&self, tx: &TxHandle) -> Result<Self, StoreError>;
}

#[cfg(all(feature = "postgres", feature = "redis"))]
fn mismatch(span: &tracing::Span, expected: BackendKind, found: BackendKind) -> StoreError {
    let _entered = span.enter();
    tracing::error!(%expected, %found, "transaction from another backend passed to with_tx");
    StoreError::BackendMismatch { expected, found }
}

/// Begin on `repo`, run `f` with the handle, then commit on `Ok` or roll back
/// on `Err`.
///
/// The closure receives a clone of the handle to pass to other repositories
/// with [`Repository::with_tx`]; it must not finalize the transaction itself.
///
/// # Errors
/// Returns the closure's error (after rolling back) or the commit error.
pub async fn run_in_tx<R, F, Fut, T>(ctx: &Context, repo: &R, f: F) -> Result<T, StoreError>
where
    R: Repository,
    F: FnOnce(TxHandle) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let tx = repo.begin(ctx).await?;
    match f(tx.clone()).await {
        Ok(value) => {
            tx.commit(ctx).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback(ctx).await {
                tracing::error!(
                    backend = %tx.backend_kind(),
                    error = %rollback_err,
                    cause = %err,
                    "rollback after failed unit of work also failed"
                );
            }
            Err(err)
        }
    }
}

/// Where a [`SqlRepository`] sends its statements.
#[cfg(feature = "postgres")]
#[derive(Debug, Clone)]
enum SqlExecutor {
    Store(PgStore),
    Tx(PgTx),
}

/// Shared base for relational repositories: an executor plus a tracing span.
#[cfg(feature = "postgres")]
#[derive(Debug, Clone)]
pub struct SqlRepository {
    store: PgStore,
    exec: SqlExecutor,
    span: tracing::Span,
}

#[cfg(feature = "postgres")]
impl SqlRepository {
    #[must_use]
    pub fn new(store: PgStore, name: &'static str) -> Self {
        Self {
            exec: SqlExecutor::Store(store.clone()),
            store,
            span: tracing::debug_span!("repository", name, backend = "postgres"),
        }
    }

    /// True when bound to a transaction rather than the pool.
    #[must_use]
    pub fn in_tx(&self) -> bool {
        matches!(self.exec, SqlExecutor::Tx(_))
    }
}

#[cfg(feature = "postgres")]
impl Repository for SqlRepository {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn begin(&self, ctx: &Context) -> Result<TxHandle, StoreError> {
        let tx = Conn::begin(&self.store, ctx)
            .instrument(self.span.clone())
            .await?;
        Ok(TxHandle::Postgres(tx))
    }

    fn with_tx(&self, tx: &TxHandle) -> Result<Self, StoreError> {
        match tx {
            TxHandle::Postgres(tx) => Ok(Self {
                store: self.store.clone(),
                exec: SqlExecutor::Tx(tx.clone()),
                span: self.span.clone(),
            }),
            #[cfg(feature = "redis")]
            other => Err(mismatch(
                &self.span,
                BackendKind::Postgres,
                other.backend_kind(),
            )),
        }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Conn for SqlRepository {
    type Rows = PgRows;
    type Tx = PgTx;

    async fn execute(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<ExecResult, StoreError> {
        let span = self.span.clone();
        match &self.exec {
            SqlExecutor::Store(store) => store.execute(ctx, statement, args).instrument(span).await,
            SqlExecutor::Tx(tx) => tx.execute(ctx, statement, args).instrument(span).await,
        }
    }

    async fn query(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<PgRows, StoreError> {
        let span = self.span.clone();
        match &self.exec {
            SqlExecutor::Store(store) => store.query(ctx, statement, args).instrument(span).await,
            SqlExecutor::Tx(tx) => tx.query(ctx, statement, args).instrument(span).await,
        }
    }

    async fn query_row(&self, ctx: &Context, statement: &str, args: &[RowValues]) -> Row {
        let span = self.span.clone();
        match &self.exec {
            SqlExecutor::Store(store) => store.query_row(ctx, statement, args).instrument(span).await,
            SqlExecutor::Tx(tx) => tx.query_row(ctx, statement, args).instrument(span).await,
        }
    }

    async fn begin(&self, ctx: &Context) -> Result<PgTx, StoreError> {
        let span = self.span.clone();
        match &self.exec {
            SqlExecutor::Store(store) => Conn::begin(store, ctx).instrument(span).await,
            SqlExecutor::Tx(tx) => Conn::begin(tx, ctx).instrument(span).await,
        }
    }
}

/// Where a [`CacheRepository`] sends its commands.
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
enum CacheExecutor {
    Store(RedisStore),
    Tx(RedisTx),
}

/// Shared base for cache repositories: an executor, the store's scanner bases
/// and a tracing span.
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct CacheRepository {
    store: RedisStore,
    exec: CacheExecutor,
    span: tracing::Span,
}

#[cfg(feature = "redis")]
impl CacheRepository {
    #[must_use]
    pub fn new(store: RedisStore, name: &'static str) -> Self {
        Self {
            exec: CacheExecutor::Store(store.clone()),
            store,
            span: tracing::debug_span!("repository", name, backend = "redis"),
        }
    }

    /// Scanner bases injected into the underlying store.
    #[must_use]
    pub fn scanners(&self) -> &Scanners {
        self.store.scanners()
    }

    #[must_use]
    pub fn in_tx(&self) -> bool {
        matches!(self.exec, CacheExecutor::Tx(_))
    }
}

#[cfg(feature = "redis")]
impl Repository for CacheRepository {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn begin(&self, ctx: &Context) -> Result<TxHandle, StoreError> {
        let tx = KvConn::begin(&self.store, ctx).await?;
        Ok(TxHandle::Redis(tx))
    }

    fn with_tx(&self, tx: &TxHandle) -> Result<Self, StoreError> {
        match tx {
            TxHandle::Redis(tx) => Ok(Self {
                store: self.store.clone(),
                exec: CacheExecutor::Tx(tx.clone()),
                span: self.span.clone(),
            }),
            #[cfg(feature = "postgres")]
            other => Err(mismatch(&self.span, BackendKind::Redis, other.backend_kind())),
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl KvConn for CacheRepository {
    type Tx = RedisTx;

    async fn get<T>(&self, ctx: &Context, key: &str) -> Result<T, StoreError>
    where
        T: KvValue + Send,
    {
        let span = self.span.clone();
        match &self.exec {
            CacheExecutor::Store(store) => store.get(ctx, key).instrument(span).await,
            CacheExecutor::Tx(tx) => tx.get(ctx, key).instrument(span).await,
        }
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: &[u8],
        expiration: Expiration,
    ) -> Result<(), StoreError> {
        let span = self.span.clone();
        match &self.exec {
            CacheExecutor::Store(store) => store.set(ctx, key, value, expiration).instrument(span).await,
            CacheExecutor::Tx(tx) => tx.set(ctx, key, value, expiration).instrument(span).await,
        }
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<u64, StoreError> {
        let span = self.span.clone();
        match &self.exec {
            CacheExecutor::Store(store) => store.delete(ctx, key).instrument(span).await,
            CacheExecutor::Tx(tx) => tx.delete(ctx, key).instrument(span).await,
        }
    }

    async fn exists(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StoreError> {
        let span = self.span.clone();
        match &self.exec {
            CacheExecutor::Store(store) => store.exists(ctx, keys).instrument(span).await,
            CacheExecutor::Tx(tx) => tx.exists(ctx, keys).instrument(span).await,
        }
    }

    async fn scan(&self, ctx: &Context, scanner: &(dyn Scanner + '_)) -> ScanIterator {
        let span = self.span.clone();
        match &self.exec {
            CacheExecutor::Store(store) => store.scan(ctx, scanner).instrument(span).await,
            CacheExecutor::Tx(tx) => tx.scan(ctx, scanner).instrument(span).await,
        }
    }

    async fn begin(&self, ctx: &Context) -> Result<RedisTx, StoreError> {
        let span = self.span.clone();
        match &self.exec {
            CacheExecutor::Store(store) => KvConn::begin(store, ctx).instrument(span).await,
            CacheExecutor::Tx(tx) => KvConn::begin(tx, ctx).instrument(span).await,
        }
    }
}

#[cfg(all(test, feature = "redis"))]
mod tests {
    use std::time::Duration;

    use deadpool_redis::Runtime;

    use super::*;

    fn offline_cache() -> CacheRepository {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:1/0")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        CacheRepository::new(RedisStore::from_pool(pool, Duration::from_millis(50)), "sessions")
    }

    #[tokio::test]
    async fn with_tx_routes_writes_into_the_transaction() {
        let ctx = Context::background();
        let repo = offline_cache();
        let handle = Repository::begin(&repo, &ctx).await.unwrap();
        assert_eq!(handle.backend_kind(), BackendKind::Redis);

        let bound = repo.with_tx(&handle).unwrap();
        assert!(bound.in_tx());
        assert!(!repo.in_tx());
        bound
            .set(&ctx, "session:a", b"token", Expiration::After(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(handle.as_redis().unwrap().queued(), 1);
    }

    #[tokio::test]
    async fn run_in_tx_rolls_back_on_error() {
        let ctx = Context::background();
        let repo = offline_cache();
        let mut seen = None;
        let err = run_in_tx(&ctx, &repo, |tx| {
            seen = Some(tx.clone());
            let repo = repo.clone();
            let ctx = ctx.clone();
            async move {
                let bound = repo.with_tx(&tx)?;
                bound.set(&ctx, "k", b"v", Expiration::Never).await?;
                Err::<(), _>(StoreError::Other("business rule failed".into()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Other(_)));
        let tx = seen.unwrap();
        assert!(tx.is_finished());
        // Discarded, so a second finalize is rejected.
        assert!(matches!(
            tx.rollback(&ctx).await,
            Err(StoreError::TxClosed("discarded"))
        ));
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn with_tx_rejects_other_backend() {
        use tokio_postgres::NoTls;

        let ctx = Context::background();
        let cache = offline_cache();
        let redis_tx = Repository::begin(&cache, &ctx).await.unwrap();

        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some("127.0.0.1".into());
        cfg.port = Some(1);
        cfg.user = Some("notes".into());
        cfg.dbname = Some("notes".into());
        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .unwrap();
        let sql = SqlRepository::new(PgStore::from_pool(pool), "users");

        let err = sql.with_tx(&redis_tx).unwrap_err();
        assert!(matches!(
            err,
            StoreError::BackendMismatch {
                expected: BackendKind::Postgres,
                found: BackendKind::Redis,
            }
        ));
    }
}
