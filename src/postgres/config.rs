use std::time::Duration;

use deadpool_postgres::{
    Config as PgPoolConfig, ManagerConfig, PoolConfig, RecyclingMethod, SslMode, Timeouts,
};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pool::PoolPolicy;

/// Transport security for the relational connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    #[default]
    Disable,
    Prefer,
    /// Needs a TLS connector, which this build does not ship.
    Require,
}

/// Connection settings for [`PgStore::connect`](super::PgStore::connect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Installed as the connection's `search_path` when set.
    pub schema: Option<String>,
    pub ssl_mode: PgSslMode,
    pub application_name: Option<String>,
    pub max_conns: usize,
    pub min_conns: usize,
    pub max_conn_lifetime: Option<Duration>,
    pub max_conn_idle_time: Option<Duration>,
    pub health_check_period: Duration,
    pub connect_timeout: Option<Duration>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            schema: None,
            ssl_mode: PgSslMode::Disable,
            application_name: None,
            max_conns: 16,
            min_conns: 0,
            max_conn_lifetime: Some(Duration::from_secs(60 * 60)),
            max_conn_idle_time: Some(Duration::from_secs(30 * 60)),
            health_check_period: Duration::from_secs(60),
            connect_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl PostgresConfig {
    /// Check the settings before any pool is built.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.database.is_empty() {
            return Err(StoreError::ConfigError("database is required".to_string()));
        }
        if self.host.is_empty() {
            return Err(StoreError::ConfigError("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(StoreError::ConfigError("port is required".to_string()));
        }
        if self.user.is_empty() {
            return Err(StoreError::ConfigError("user is required".to_string()));
        }
        if self.max_conns == 0 {
            return Err(StoreError::ConfigError(
                "max_conns must be at least 1".to_string(),
            ));
        }
        if self.min_conns > self.max_conns {
            return Err(StoreError::ConfigError(format!(
                "min_conns ({}) exceeds max_conns ({})",
                self.min_conns, self.max_conns
            )));
        }
        if self.health_check_period.is_zero() {
            return Err(StoreError::ConfigError(
                "health_check_period must be non-zero".to_string(),
            ));
        }
        if let Some(schema) = &self.schema
            && !is_plain_identifier(schema)
        {
            return Err(StoreError::ConfigError(format!(
                "schema {schema:?} is not a plain identifier"
            )));
        }
        if self.ssl_mode == PgSslMode::Require {
            return Err(StoreError::ConfigError(
                "ssl_mode=require needs a TLS connector; use disable or prefer".to_string(),
            ));
        }
        Ok(())
    }

    /// Translate into the pool library's configuration.
    #[must_use]
    pub fn to_deadpool_config(&self) -> PgPoolConfig {
        let mut cfg = PgPoolConfig::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.user = Some(self.user.clone());
        if !self.password.is_empty() {
            cfg.password = Some(self.password.clone());
        }
        cfg.dbname = Some(self.database.clone());
        cfg.application_name.clone_from(&self.application_name);
        cfg.options = self
            .schema
            .as_ref()
            .map(|schema| format!("-c search_path={schema}"));
        cfg.connect_timeout = self.connect_timeout;
        cfg.ssl_mode = Some(match self.ssl_mode {
            PgSslMode::Disable => SslMode::Disable,
            PgSslMode::Prefer => SslMode::Prefer,
            PgSslMode::Require => SslMode::Require,
        });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig {
            max_size: self.max_conns,
            timeouts: Timeouts {
                wait: self.connect_timeout,
                create: self.connect_timeout,
                recycle: self.connect_timeout,
            },
            ..PoolConfig::default()
        });
        cfg
    }

    /// Maintenance rules for idle and aged connections.
    #[must_use]
    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            max_lifetime: self.max_conn_lifetime,
            max_idle: self.max_conn_idle_time,
            max_idle_conns: None,
            interval: self.health_check_period,
        }
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PostgresConfig {
        PostgresConfig {
            user: "notes".into(),
            password: "secret".into(),
            database: "notes".into(),
            schema: Some("app".into()),
            application_name: Some("notes-api".into()),
            ..PostgresConfig::default()
        }
    }

    #[test]
    fn requires_database_and_user() {
        let mut cfg = valid();
        cfg.database.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("database is required"));

        let mut cfg = valid();
        cfg.user.clear();
        assert!(matches!(cfg.validate(), Err(StoreError::ConfigError(_))));
    }

    #[test]
    fn rejects_min_above_max() {
        let cfg = PostgresConfig {
            min_conns: 8,
            max_conns: 4,
            ..valid()
        };
        assert!(matches!(cfg.validate(), Err(StoreError::ConfigError(_))));
    }

    #[test]
    fn rejects_ssl_require_and_odd_schema() {
        let cfg = PostgresConfig {
            ssl_mode: PgSslMode::Require,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = PostgresConfig {
            schema: Some("app; drop table users".into()),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn translates_schema_and_pool_size() {
        let cfg = PostgresConfig {
            max_conns: 7,
            ..valid()
        };
        cfg.validate().unwrap();
        let pool_cfg = cfg.to_deadpool_config();
        assert_eq!(pool_cfg.dbname.as_deref(), Some("notes"));
        assert_eq!(pool_cfg.options.as_deref(), Some("-c search_path=app"));
        assert_eq!(pool_cfg.application_name.as_deref(), Some("notes-api"));
        assert_eq!(pool_cfg.pool.map(|p| p.max_size), Some(7));
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: PostgresConfig = serde_json::from_str(
            r#"{"user":"notes","database":"notes","ssl_mode":"prefer","max_conns":4}"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 5432);
        assert_eq!(cfg.ssl_mode, PgSslMode::Prefer);
        assert_eq!(cfg.max_conns, 4);
        assert!(cfg.validate().is_ok());
    }
}
