use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use deadpool_redis::redis::{self, Pipeline, Value};

use crate::context::Context;
use crate::error::StoreError;
use crate::kv::{Expiration, KvConn, KvTx, KvValue};
use crate::scan::{ScanIterator, Scanner};

use super::store::{RedisStore, set_command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    Executed,
    Discarded,
}

impl QueueState {
    fn closed_label(self) -> Option<&'static str> {
        match self {
            QueueState::Open => None,
            QueueState::Executed => Some("executed"),
            QueueState::Discarded => Some("discarded"),
        }
    }
}

struct TxQueue {
    pipe: Pipeline,
    queued: usize,
    state: QueueState,
}

/// Pipelined `MULTI`/`EXEC` transaction.
///
/// Writes are queued locally and sent in one round trip by [`KvTx::exec`].
/// Reads go straight to the store, so they never observe queued writes. The
/// queue is not safe for concurrent use.
#[derive(Clone)]
pub struct RedisTx {
    store: RedisStore,
    queue: Arc<Mutex<TxQueue>>,
}

impl RedisTx {
    pub(crate) fn new(store: RedisStore) -> Self {
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self {
            store,
            queue: Arc::new(Mutex::new(TxQueue {
                pipe,
                queued: 0,
                state: QueueState::Open,
            })),
        }
    }

    /// Number of commands waiting for `exec`.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.lock().map_or(0, |queue| queue.queued)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TxQueue>, StoreError> {
        self.queue
            .lock()
            .map_err(|_| StoreError::Other("transaction queue poisoned".to_string()))
    }

    fn enqueue(&self, op: &'static str, key: &str, cmd: redis::Cmd) -> Result<(), StoreError> {
        let mut queue = self.lock()?;
        if let Some(label) = queue.state.closed_label() {
            return Err(StoreError::TxClosed(label));
        }
        queue.pipe.add_command(cmd);
        queue.queued += 1;
        tracing::trace!(op, key, queued = queue.queued, "redis command queued");
        Ok(())
    }

    /// Take the queue and move to a terminal state.
    fn close(&self, next: QueueState) -> Result<(Pipeline, usize), StoreError> {
        let mut queue = self.lock()?;
        if let Some(label) = queue.state.closed_label() {
            return Err(StoreError::TxClosed(label));
        }
        queue.state = next;
        let queued = std::mem::take(&mut queue.queued);
        let pipe = std::mem::replace(&mut queue.pipe, redis::pipe());
        Ok((pipe, queued))
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        match self.lock()?.state.closed_label() {
            Some(label) => Err(StoreError::TxClosed(label)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RedisTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.queue.lock().map(|q| q.state).ok();
        f.debug_struct("RedisTx")
            .field("state", &state)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KvConn for RedisTx {
    type Tx = RedisTx;

    async fn get<T>(&self, ctx: &Context, key: &str) -> Result<T, StoreError>
    where
        T: KvValue + Send,
    {
        self.ensure_open()?;
        self.store.get(ctx, key).await
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: &[u8],
        expiration: Expiration,
    ) -> Result<(), StoreError> {
        ctx.check()?;
        self.enqueue("set", key, set_command(key, value, expiration))
    }

    /// Queued; the reply from `exec` carries the count, so this returns 0.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<u64, StoreError> {
        ctx.check()?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.enqueue("del", key, cmd)?;
        Ok(0)
    }

    async fn exists(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StoreError> {
        self.ensure_open()?;
        self.store.exists(ctx, keys).await
    }

    async fn scan(&self, ctx: &Context, scanner: &(dyn Scanner + '_)) -> ScanIterator {
        if let Err(err) = self.ensure_open() {
            return ScanIterator::failed(err);
        }
        scanner.scan(ctx).await
    }

    /// Pipelines do not nest; this opens an independent transaction.
    async fn begin(&self, ctx: &Context) -> Result<RedisTx, StoreError> {
        self.ensure_open()?;
        self.store.begin(ctx).await
    }
}

#[async_trait]
impl KvTx for RedisTx {
    type Reply = Value;

    async fn exec(&self, ctx: &Context) -> Result<Vec<Value>, StoreError> {
        ctx.check()?;
        let (pipe, queued) = self.close(QueueState::Executed)?;
        if queued == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let io_timeout = self.store.io_timeout();
        let pool = self.store.pool();
        let res = ctx
            .run(async {
                let mut conn = pool.get().await?;
                let replies: Vec<Value> =
                    tokio::time::timeout(io_timeout, pipe.query_async(&mut conn))
                        .await
                        .map_err(|_| StoreError::DeadlineExceeded)??;
                Ok::<_, StoreError>(replies)
            })
            .await;
        let duration = started.elapsed();
        match &res {
            Ok(replies) => tracing::debug!(queued, replies = replies.len(), ?duration, "redis exec ok"),
            Err(err) => tracing::error!(queued, ?duration, error = %err, "redis exec failed"),
        }
        res
    }

    async fn discard(&self, ctx: &Context) -> Result<(), StoreError> {
        ctx.check()?;
        let (_, queued) = self.close(QueueState::Discarded)?;
        tracing::debug!(queued, "redis transaction discarded");
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.queue
            .lock()
            .map_or(true, |queue| queue.state != QueueState::Open)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use deadpool_redis::Runtime;

    use super::*;

    /// A store whose pool points at a closed port; nothing here may dial it.
    fn offline_store() -> RedisStore {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:1/0")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        RedisStore::from_pool(pool, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn writes_are_queued_until_exec() {
        let ctx = Context::background();
        let tx = offline_store().begin(&ctx).await.unwrap();
        tx.set(&ctx, "session:a", b"1", Expiration::Never).await.unwrap();
        assert_eq!(tx.delete(&ctx, "session:b").await.unwrap(), 0);
        assert_eq!(tx.queued(), 2);
        assert!(!tx.is_finished());
    }

    #[tokio::test]
    async fn discard_then_write_fails() {
        let ctx = Context::background();
        let tx = offline_store().begin(&ctx).await.unwrap();
        tx.set(&ctx, "k", b"v", Expiration::Never).await.unwrap();
        tx.discard(&ctx).await.unwrap();
        assert!(tx.is_finished());
        assert_eq!(tx.queued(), 0);

        let err = tx.set(&ctx, "k", b"v", Expiration::Never).await.unwrap_err();
        assert!(matches!(err, StoreError::TxClosed("discarded")));
        let err = tx.exec(&ctx).await.unwrap_err();
        assert!(matches!(err, StoreError::TxClosed("discarded")));
        let err = tx.get::<String>(&ctx, "k").await.unwrap_err();
        assert!(matches!(err, StoreError::TxClosed(_)));
    }

    #[tokio::test]
    async fn empty_exec_skips_the_server() {
        let ctx = Context::background();
        let tx = offline_store().begin(&ctx).await.unwrap();
        assert!(tx.exec(&ctx).await.unwrap().is_empty());
        let err = tx.discard(&ctx).await.unwrap_err();
        assert!(matches!(err, StoreError::TxClosed("executed")));
    }

    #[tokio::test]
    async fn clones_share_the_queue() {
        let ctx = Context::background();
        let tx = offline_store().begin(&ctx).await.unwrap();
        let other = tx.clone();
        other.set(&ctx, "k", b"v", Expiration::Never).await.unwrap();
        assert_eq!(tx.queued(), 1);
        tx.discard(&ctx).await.unwrap();
        assert!(other.is_finished());
    }
}
