//! Convenient imports for common functionality.
//!
//! Brings the facade traits into scope along with the types most callers touch.

pub use crate::context::Context;
pub use crate::error::{ErrorKind, StoreError};
pub use crate::kv::{Expiration, KvConn, KvTx, KvValue};
pub use crate::relational::{Conn, ExecResult, Row, Rows, Tx};
#[cfg(any(feature = "postgres", feature = "redis"))]
pub use crate::repository::{Repository, TxHandle, run_in_tx};
pub use crate::scan::{ScanIterator, Scanner};
pub use crate::types::{BackendKind, RowValues};

#[cfg(feature = "postgres")]
pub use crate::postgres::{PgStore, PgTx, PostgresConfig};
#[cfg(feature = "postgres")]
pub use crate::repository::SqlRepository;

#[cfg(feature = "redis")]
pub use crate::redis::{RedisConfig, RedisStore, RedisTx};
#[cfg(feature = "redis")]
pub use crate::repository::CacheRepository;
