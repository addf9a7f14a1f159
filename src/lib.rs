//! Async storage facades for services that keep durable records in Postgres
//! and ephemeral state in Redis.
//!
//! - [`relational`]: `execute` / `query` / `query_row` over a pool or transaction,
//!   implemented by [`postgres::PgStore`] and [`postgres::PgTx`].
//! - [`kv`]: `get` / `set` / `delete` / `exists` / `scan`, implemented by
//!   [`redis::RedisStore`] and the pipelined [`redis::RedisTx`].
//! - [`repository`]: transaction-bound repositories and [`repository::run_in_tx`].
//!
//! Constraint violations and missing values surface as [`ErrorKind`]s so callers
//! never match on backend error text.

pub mod context;
pub mod error;
pub mod kv;
pub mod pool;
pub mod prelude;
pub mod relational;
#[cfg(any(feature = "postgres", feature = "redis"))]
pub mod repository;
pub mod scan;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use context::Context;
pub use error::{CanonicalError, ErrorKind, StoreError};
pub use types::{BackendKind, RowValues};

#[cfg(feature = "postgres")]
pub use error::normalize_postgres;
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgTx, PostgresConfig};
#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisStore, RedisTx};
