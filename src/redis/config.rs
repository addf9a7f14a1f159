use std::time::Duration;

use deadpool_redis::{Config as RedisPoolConfig, PoolConfig, Timeouts};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StoreError;
use crate::pool::PoolPolicy;

/// Transport security; present means `rediss://`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisTlsConfig {
    /// Skip certificate verification. Development only.
    pub insecure: bool,
}

/// Connection settings for [`RedisStore::connect`](super::RedisStore::connect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Logical database index; the server's `databases` setting bounds it.
    pub database: u32,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub min_idle_conns: usize,
    pub max_idle_conns: usize,
    pub max_active_conns: usize,
    pub conn_max_idle_time: Option<Duration>,
    pub conn_max_lifetime: Option<Duration>,
    pub maintenance_interval: Duration,
    pub tls: Option<RedisTlsConfig>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            user: None,
            password: None,
            database: 0,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            min_idle_conns: 0,
            max_idle_conns: 8,
            max_active_conns: 16,
            conn_max_idle_time: Some(Duration::from_secs(5 * 60)),
            conn_max_lifetime: None,
            maintenance_interval: Duration::from_secs(60),
            tls: None,
        }
    }
}

impl RedisConfig {
    /// Check the settings before any pool is built.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.host.is_empty() {
            return Err(StoreError::ConfigError("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(StoreError::ConfigError("port is required".to_string()));
        }
        if self.max_active_conns == 0 {
            return Err(StoreError::ConfigError(
                "max_active_conns must be at least 1".to_string(),
            ));
        }
        if self.max_idle_conns > self.max_active_conns {
            return Err(StoreError::ConfigError(format!(
                "max_idle_conns ({}) exceeds max_active_conns ({})",
                self.max_idle_conns, self.max_active_conns
            )));
        }
        if self.min_idle_conns > self.max_active_conns {
            return Err(StoreError::ConfigError(format!(
                "min_idle_conns ({}) exceeds max_active_conns ({})",
                self.min_idle_conns, self.max_active_conns
            )));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(StoreError::ConfigError(
                "read_timeout and write_timeout must be non-zero".to_string(),
            ));
        }
        if self.user.is_some() && self.password.is_none() {
            return Err(StoreError::ConfigError(
                "user requires a password".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection URL, with credentials percent-encoded.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` if the host cannot form a URL.
    pub fn url(&self) -> Result<String, StoreError> {
        let scheme = if self.tls.is_some() { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!(
            "{scheme}://{}:{}/{}",
            self.host, self.port, self.database
        ))
        .map_err(|e| StoreError::ConfigError(format!("invalid redis address: {e}")))?;
        if let Some(user) = &self.user {
            url.set_username(user)
                .map_err(|()| StoreError::ConfigError("invalid redis user".to_string()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|()| StoreError::ConfigError("invalid redis password".to_string()))?;
        }
        if self.tls.as_ref().is_some_and(|tls| tls.insecure) {
            url.set_fragment(Some("insecure"));
        }
        Ok(url.into())
    }

    /// Timeout applied to every command round trip.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        self.read_timeout.max(self.write_timeout)
    }

    /// Translate into the pool library's configuration.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` if the URL cannot be built.
    pub fn to_deadpool_config(&self) -> Result<RedisPoolConfig, StoreError> {
        let mut config = RedisPoolConfig::from_url(self.url()?);
        config.pool = Some(PoolConfig {
            max_size: self.max_active_conns,
            timeouts: Timeouts {
                wait: Some(self.dial_timeout),
                create: Some(self.dial_timeout),
                recycle: Some(self.io_timeout()),
            },
            ..PoolConfig::default()
        });
        Ok(config)
    }

    /// Maintenance rules for idle and aged connections.
    #[must_use]
    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            max_lifetime: self.conn_max_lifetime,
            max_idle: self.conn_max_idle_time,
            max_idle_conns: Some(self.max_idle_conns),
            interval: self.maintenance_interval,
        }
    }
}
