//! Backend-agnostic key-value contracts.
//!
//! Values are opaque bytes on the way in; encoding is the caller's choice.
//! [`KvValue`] covers the common decodings on the way out.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::StoreError;
use crate::scan::{ScanIterator, Scanner};

/// Expiration applied by [`KvConn::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiration {
    /// Persist until deleted.
    #[default]
    Never,
    /// Expire after the given duration.
    After(Duration),
    /// Keep whatever TTL the key already has.
    KeepTtl,
}

impl From<Duration> for Expiration {
    /// A zero duration means no expiration.
    fn from(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Expiration::Never
        } else {
            Expiration::After(ttl)
        }
    }
}

impl From<Option<Duration>> for Expiration {
    fn from(ttl: Option<Duration>) -> Self {
        ttl.map_or(Expiration::Never, Expiration::from)
    }
}

/// Decoding of stored bytes into a destination type.
pub trait KvValue: Sized {
    /// # Errors
    /// Returns `StoreError::ScanError` when the bytes do not decode.
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError>;
}

impl KvValue for Vec<u8> {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        Ok(bytes)
    }
}

impl KvValue for String {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        String::from_utf8(bytes).map_err(|e| StoreError::ScanError(format!("value is not utf-8: {e}")))
    }
}

fn parse_text<T>(bytes: Vec<u8>, target: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text = String::from_kv_bytes(bytes)?;
    text.trim()
        .parse()
        .map_err(|e| StoreError::ScanError(format!("cannot decode {text:?} as {target}: {e}")))
}

impl KvValue for i64 {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        parse_text(bytes, "i64")
    }
}

impl KvValue for u64 {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        parse_text(bytes, "u64")
    }
}

impl KvValue for f64 {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        parse_text(bytes, "f64")
    }
}

impl KvValue for bool {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        match bytes.as_slice() {
            b"1" | b"true" => Ok(true),
            b"0" | b"false" => Ok(false),
            other => Err(StoreError::ScanError(format!(
                "cannot decode {:?} as bool",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl KvValue for serde_json::Value {
    fn from_kv_bytes(bytes: Vec<u8>) -> Result<Self, StoreError> {
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::ScanError(format!("value is not json: {e}")))
    }
}

/// Command surface shared by a key-value store and its pipelined transactions.
#[async_trait]
pub trait KvConn: Send + Sync {
    type Tx: KvTx;

    /// Read and decode a value. A missing key is the canonical `KeyNotFound`.
    async fn get<T>(&self, ctx: &Context, key: &str) -> Result<T, StoreError>
    where
        T: KvValue + Send;

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: &[u8],
        expiration: Expiration,
    ) -> Result<(), StoreError>;

    /// Returns how many keys were removed.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<u64, StoreError>;

    /// Returns how many of `keys` exist, in one round trip.
    async fn exists(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StoreError>;

    /// Enumerate with a scanner, typically derived from the store's bases.
    async fn scan(&self, ctx: &Context, scanner: &(dyn Scanner + '_)) -> ScanIterator {
        scanner.scan(ctx).await
    }

    /// Open a pipelined transaction.
    async fn begin(&self, ctx: &Context) -> Result<Self::Tx, StoreError>;
}

/// A batch of queued writes applied atomically on [`KvTx::exec`].
///
/// Reads on an open transaction go straight to the store and do not see the
/// queued writes.
#[async_trait]
pub trait KvTx: KvConn {
    /// Raw per-command reply type.
    type Reply: Send;

    /// Flush the queue; returns one reply per queued command.
    async fn exec(&self, ctx: &Context) -> Result<Vec<Self::Reply>, StoreError>;

    /// Drop the queue without sending it.
    async fn discard(&self, ctx: &Context) -> Result<(), StoreError>;

    fn is_finished(&self) -> bool;
}
