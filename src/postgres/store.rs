use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::context::Context;
use crate::error::{StoreError, normalize_postgres};
use crate::pool::{MaintenanceTask, spawn_maintenance};
use crate::relational::{Conn, ExecResult, Row};
use crate::types::{BackendKind, RowValues};

use super::config::PostgresConfig;
use super::query::{PgRows, execute_on, first_row, stream_on};
use super::transaction::PgTx;

/// Pooled Postgres store. Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: Pool,
    maintenance: Option<Arc<MaintenanceTask>>,
}

impl PgStore {
    /// Build the pool, warm it up and verify the server is reachable.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` for invalid settings,
    /// `StoreError::ConnectionError` if the pool cannot be built, or the
    /// underlying error if the reachability check fails.
    pub async fn connect(ctx: &Context, config: &PostgresConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let pool = config
            .to_deadpool_config()
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                StoreError::ConnectionError(format!("Failed to create Postgres pool: {e}"))
            })?;

        // Hold every warm connection at once so the pool really opens `min_conns`.
        let mut warm = Vec::with_capacity(config.min_conns);
        for _ in 0..config.min_conns {
            warm.push(ctx.run(async { pool.get().await.map_err(StoreError::from) }).await?);
        }
        drop(warm);

        let store = Self {
            maintenance: spawn_maintenance("postgres", pool.clone(), config.pool_policy())
                .map(Arc::new),
            pool,
        };
        store.ping(ctx).await?;

        let status = store.pool.status();
        tracing::info!(
            host = %config.host,
            database = %config.database,
            max_size = status.max_size,
            size = status.size,
            "postgres store connected"
        );
        Ok(store)
    }

    /// Wrap a pool the caller built. Does not touch the network.
    #[must_use]
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            maintenance: None,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    /// Round-trip `SELECT 1` on a pooled connection.
    ///
    /// # Errors
    /// Returns the pool or server error.
    pub async fn ping(&self, ctx: &Context) -> Result<(), StoreError> {
        let conn = self.checkout(ctx).await?;
        ctx.run(async {
            conn.simple_query("SELECT 1")
                .await
                .map_err(normalize_postgres)
        })
        .await?;
        Ok(())
    }

    /// Stop maintenance and close the pool; outstanding connections are dropped
    /// when returned.
    pub fn close(&self) {
        if let Some(task) = &self.maintenance {
            task.abort();
        }
        self.pool.close();
    }

    pub(crate) async fn checkout(&self, ctx: &Context) -> Result<Object, StoreError> {
        ctx.run(async { self.pool.get().await.map_err(StoreError::from) })
            .await
    }
}

#[async_trait]
impl Conn for PgStore {
    type Rows = PgRows;
    type Tx = PgTx;

    async fn execute(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<ExecResult, StoreError> {
        let conn = self.checkout(ctx).await?;
        execute_on(ctx, &conn, statement, args).await
    }

    async fn query(
        &self,
        ctx: &Context,
        statement: &str,
        args: &[RowValues],
    ) -> Result<PgRows, StoreError> {
        let conn = self.checkout(ctx).await?;
        let (columns, stream) = stream_on(ctx, &conn, statement, args).await?;
        Ok(PgRows::new(columns, stream, Some(conn)))
    }

    async fn query_row(&self, ctx: &Context, statement: &str, args: &[RowValues]) -> Row {
        match self.query(ctx, statement, args).await {
            Ok(rows) => first_row(ctx, rows).await,
            Err(err) => Row::failed(err),
        }
    }

    async fn begin(&self, ctx: &Context) -> Result<PgTx, StoreError> {
        let conn = self.checkout(ctx).await?;
        PgTx::begin_root(ctx, conn).await
    }
}
