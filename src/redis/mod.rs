//! Redis backend for the key-value facade.

pub mod config;
mod pager;
mod store;
mod transaction;

pub use config::{RedisConfig, RedisTlsConfig};
pub use pager::RedisPager;
pub use store::RedisStore;
pub use transaction::RedisTx;

/// Raw reply type returned by [`RedisTx`] on `exec`.
pub use deadpool_redis::redis::Value as RedisValue;
