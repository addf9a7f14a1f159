//! Background upkeep for the client-library pools.
//!
//! Pooling itself belongs to `deadpool`; this module only evicts connections that
//! outlived their lifetime or sat idle too long, on a fixed interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use deadpool::managed::{Manager, Object, Pool};
use tokio::task::JoinHandle;

/// Eviction rules applied by [`spawn_maintenance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Connections older than this are closed.
    pub max_lifetime: Option<Duration>,
    /// Connections unused for longer than this are closed.
    pub max_idle: Option<Duration>,
    /// At most this many idle connections survive a sweep.
    pub max_idle_conns: Option<usize>,
    /// How often the pool is swept.
    pub interval: Duration,
}

impl PoolPolicy {
    /// True when neither limit is set, so a sweep would never evict anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.max_lifetime.is_none() && self.max_idle.is_none() && self.max_idle_conns.is_none()
    }

    /// Whether a connection with the given age and idle time survives a sweep.
    #[must_use]
    pub fn keeps(&self, age: Duration, idle: Duration) -> bool {
        self.max_lifetime.is_none_or(|max| age < max) && self.max_idle.is_none_or(|max| idle < max)
    }

    /// Like [`PoolPolicy::keeps`], also capping survivors at `max_idle_conns`
    /// given how many idle connections this sweep already kept.
    #[must_use]
    pub fn admits(&self, age: Duration, idle: Duration, kept: usize) -> bool {
        self.keeps(age, idle) && self.max_idle_conns.is_none_or(|max| kept < max)
    }
}

/// Handle to a running sweep; aborting happens on drop.
#[derive(Debug)]
pub struct MaintenanceTask {
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start sweeping `pool` according to `policy`.
///
/// Returns `None` when the policy can never evict anything. Must be called from
/// within a tokio runtime.
pub fn spawn_maintenance<M, W>(
    name: &'static str,
    pool: Pool<M, W>,
    policy: PoolPolicy,
) -> Option<MaintenanceTask>
where
    M: Manager + 'static,
    W: From<Object<M>> + Send + 'static,
{
    if policy.is_noop() || policy.interval.is_zero() {
        return None;
    }
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if pool.is_closed() {
                tracing::debug!(pool = name, "pool closed, stopping maintenance");
                break;
            }
            // `retain` only visits idle connections.
            let kept = AtomicUsize::new(0);
            let result = pool.retain(|_, metrics| {
                let admit =
                    policy.admits(metrics.age(), metrics.last_used(), kept.load(Ordering::Relaxed));
                if admit {
                    kept.fetch_add(1, Ordering::Relaxed);
                }
                admit
            });
            let status = pool.status();
            if result.removed.is_empty() {
                tracing::trace!(pool = name, size = status.size, "pool sweep: nothing to evict");
            } else {
                tracing::debug!(
                    pool = name,
                    retained = result.retained,
                    removed = result.removed.len(),
                    available = status.available,
                    "pool sweep evicted connections"
                );
            }
        }
    });
    Some(MaintenanceTask { handle })
}
