use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis::{self, Cmd, FromRedisValue};
use deadpool_redis::{Pool, Runtime};

use crate::context::Context;
use crate::error::StoreError;
use crate::kv::{Expiration, KvConn, KvValue};
use crate::pool::{MaintenanceTask, spawn_maintenance};
use crate::scan::{PageFetcher, Scanners};
use crate::types::BackendKind;

use super::config::RedisConfig;
use super::pager::RedisPager;
use super::transaction::RedisTx;

/// Run one command on a pooled connection, bounded by `io_timeout`.
pub(crate) async fn query_pooled<T: FromRedisValue>(
    pool: &Pool,
    io_timeout: Duration,
    cmd: &Cmd,
) -> Result<T, StoreError> {
    let mut conn = pool.get().await?;
    let reply = tokio::time::timeout(io_timeout, cmd.query_async(&mut conn))
        .await
        .map_err(|_| StoreError::DeadlineExceeded)??;
    Ok(reply)
}

/// `SET key value [PX ms | KEEPTTL]`.
pub(crate) fn set_command(key: &str, value: &[u8], expiration: Expiration) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    match expiration {
        Expiration::Never => {}
        Expiration::After(ttl) => {
            // Sub-millisecond TTLs would round to 0 and be rejected.
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        Expiration::KeepTtl => {
            cmd.arg("KEEPTTL");
        }
    }
    cmd
}

fn log_outcome<T>(op: &'static str, key: &str, started: Instant, res: &Result<T, StoreError>) {
    let duration = started.elapsed();
    match res {
        Ok(_) => tracing::debug!(op, key, ?duration, "redis command ok"),
        Err(err) if err.kind().is_some() || err.is_cancellation() => {
            tracing::debug!(op, key, ?duration, error = %err, "redis command failed");
        }
        Err(err) => tracing::error!(op, key, ?duration, error = %err, "redis command failed"),
    }
}

/// Pooled Redis store. Cheap to clone; clones share the pool and scanners.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    io_timeout: Duration,
    scanners: Arc<Scanners>,
    maintenance: Option<Arc<MaintenanceTask>>,
}

impl RedisStore {
    /// Build the pool, warm it up and verify the server answers `PING`.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` for invalid settings,
    /// `StoreError::ConnectionError` if the pool cannot be built, or the
    /// underlying error if the server is unreachable.
    pub async fn connect(ctx: &Context, config: &RedisConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let pool = config
            .to_deadpool_config()?
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::ConnectionError(format!("Failed to create Redis pool: {e}")))?;

        let mut warm = Vec::with_capacity(config.min_idle_conns);
        for _ in 0..config.min_idle_conns {
            warm.push(ctx.run(async { pool.get().await.map_err(StoreError::from) }).await?);
        }
        drop(warm);

        let mut store = Self::from_pool(pool, config.io_timeout());
        store.maintenance =
            spawn_maintenance("redis", store.pool.clone(), config.pool_policy()).map(Arc::new);
        store.ping(ctx).await?;

        let status = store.pool.status();
        tracing::info!(
            host = %config.host,
            database = config.database,
            max_size = status.max_size,
            size = status.size,
            "redis store connected"
        );
        Ok(store)
    }

    /// Wrap a pool the caller built, with the default scanner bases. Does not
    /// touch the network.
    #[must_use]
    pub fn from_pool(pool: Pool, io_timeout: Duration) -> Self {
        let scanners = Scanners::from_fn(|command| {
            Arc::new(RedisPager::new(pool.clone(), command, io_timeout)) as Arc<dyn PageFetcher>
        });
        Self {
            pool,
            io_timeout,
            scanners: Arc::new(scanners),
            maintenance: None,
        }
    }

    /// Replace the scanner bases handed out by [`RedisStore::scanners`].
    #[must_use]
    pub fn with_scanners(mut self, scanners: Scanners) -> Self {
        self.scanners = Arc::new(scanners);
        self
    }

    /// Scanner bases for keys, set members, hash fields and sorted-set members.
    #[must_use]
    pub fn scanners(&self) -> &Scanners {
        &self.scanners
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    /// # Errors
    /// Returns the pool or server error.
    pub async fn ping(&self, ctx: &Context) -> Result<(), StoreError> {
        let pong: String = self.run_command(ctx, "ping", "", &redis::cmd("PING")).await?;
        tracing::trace!(reply = %pong, "redis ping");
        Ok(())
    }

    /// Stop maintenance and close the pool.
    pub fn close(&self) {
        if let Some(task) = &self.maintenance {
            task.abort();
        }
        self.pool.close();
    }

    pub(crate) async fn run_command<T: FromRedisValue>(
        &self,
        ctx: &Context,
        op: &'static str,
        key: &str,
        cmd: &Cmd,
    ) -> Result<T, StoreError> {
        let started = Instant::now();
        let res = ctx.run(query_pooled(&self.pool, self.io_timeout, cmd)).await;
        log_outcome(op, key, started, &res);
        res
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("status", &self.pool.status())
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KvConn for RedisStore {
    type Tx = RedisTx;

    async fn get<T>(&self, ctx: &Context, key: &str) -> Result<T, StoreError>
    where
        T: KvValue + Send,
    {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let reply: Option<Vec<u8>> = self.run_command(ctx, "get", key, &cmd).await?;
        match reply {
            Some(bytes) => T::from_kv_bytes(bytes),
            None => Err(StoreError::key_not_found(key)),
        }
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: &[u8],
        expiration: Expiration,
    ) -> Result<(), StoreError> {
        let cmd = set_command(key, value, expiration);
        let _: () = self.run_command(ctx, "set", key, &cmd).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run_command(ctx, "del", key, &cmd).await
    }

    async fn exists(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(keys);
        let label = keys.join(",");
        self.run_command(ctx, "exists", &label, &cmd).await
    }

    async fn begin(&self, ctx: &Context) -> Result<RedisTx, StoreError> {
        ctx.check()?;
        Ok(RedisTx::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(cmd: &Cmd) -> String {
        String::from_utf8(cmd.get_packed_command()).unwrap()
    }

    #[test]
    fn set_without_expiration_has_no_px() {
        let cmd = set_command("k", b"v", Expiration::Never);
        assert!(!packed(&cmd).contains("PX"));
        assert!(!packed(&cmd).contains("KEEPTTL"));
    }

    #[test]
    fn set_with_ttl_uses_milliseconds() {
        let cmd = set_command("k", b"v", Expiration::After(Duration::from_secs(2)));
        assert!(packed(&cmd).contains("PX\r\n$4\r\n2000\r\n"));

        let cmd = set_command("k", b"v", Expiration::After(Duration::from_micros(10)));
        assert!(packed(&cmd).contains("PX\r\n$1\r\n1\r\n"));
    }

    #[test]
    fn set_can_keep_existing_ttl() {
        let cmd = set_command("k", b"v", Expiration::KeepTtl);
        assert!(packed(&cmd).ends_with("KEEPTTL\r\n"));
    }

    #[tokio::test]
    async fn from_pool_exposes_all_scanner_bases() {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379/0")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        let store = RedisStore::from_pool(pool, Duration::from_secs(1));
        let scanners = store.scanners();
        assert_eq!(scanners.keys.command().name(), "SCAN");
        assert_eq!(scanners.set_members.command().name(), "SSCAN");
        assert_eq!(scanners.hash_fields.command().name(), "HSCAN");
        assert_eq!(scanners.sorted_set_members.command().name(), "ZSCAN");
    }

    #[tokio::test]
    async fn exists_with_no_keys_skips_the_server() {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:1/0")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        let store = RedisStore::from_pool(pool, Duration::from_millis(50));
        let ctx = Context::background();
        assert_eq!(store.exists(&ctx, &[]).await.unwrap(), 0);
    }
}
