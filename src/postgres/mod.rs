// Postgres backend for the relational facade.
//
// - config: connection settings and pool translation
// - params: binding `RowValues` as statement arguments
// - query: value extraction, statement helpers and the streaming cursor
// - store: the pooled store
// - transaction: root transactions and savepoints

pub mod config;
pub mod params;
pub mod query;
mod store;
mod transaction;

pub use config::{PgSslMode, PostgresConfig};
pub use params::Params;
pub use query::{PgRows, postgres_extract_value};
pub use store::PgStore;
pub use transaction::PgTx;
