use std::fmt;

use thiserror::Error;

use crate::types::BackendKind;

#[cfg(feature = "redis")]
use deadpool_redis::redis::RedisError;
#[cfg(feature = "postgres")]
use tokio_postgres::error::SqlState;

/// Backend-independent failure kinds.
///
/// These are the sentinels collaborators match on. A failure that maps to one of
/// them is wrapped in a [`CanonicalError`]; use [`StoreError::kind`] to unwrap it
/// instead of comparing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A single-row query matched zero rows.
    NoRows,
    /// A CHECK constraint rejected the statement.
    CheckViolation,
    /// A UNIQUE or PRIMARY KEY constraint rejected the statement.
    UniqueViolation,
    /// A NOT NULL constraint rejected the statement.
    NotNullViolation,
    /// A FOREIGN KEY constraint rejected the statement.
    ForeignKeyViolation,
    /// The requested cache key is absent.
    KeyNotFound,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoRows => "no rows in result set",
            ErrorKind::CheckViolation => "check violation",
            ErrorKind::UniqueViolation => "unique violation",
            ErrorKind::NotNullViolation => "not null violation",
            ErrorKind::ForeignKeyViolation => "foreign key violation",
            ErrorKind::KeyNotFound => "key does not exist",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified backend failure.
///
/// `Display` yields the backend's own diagnostic text so logs stay informative,
/// while [`CanonicalError::kind`] is what programmatic matching should use.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CanonicalError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CanonicalError {
    /// Canonical error with no underlying backend error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Canonical error wrapping the original backend error.
    #[must_use]
    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PoolErrorPostgres(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    RedisError(#[from] RedisError),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    PoolErrorRedis(#[from] deadpool_redis::PoolError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("transaction already {0}")]
    TxClosed(&'static str),

    /// Commit was refused because an earlier statement failed; the transaction
    /// was rolled back instead. Carries the first failure's message.
    #[error("transaction aborted by an earlier error and rolled back: {0}")]
    TxAborted(String),

    #[error("transaction backend mismatch: expected {expected}, found {found}")]
    BackendMismatch {
        expected: BackendKind,
        found: BackendKind,
    },

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Other store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Canonical kind carried by this error, if it was classified.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StoreError::Canonical(err) => Some(err.kind()),
            _ => None,
        }
    }

    /// True when this error was classified as `kind`.
    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }

    /// True for caller-side cancellation or an expired deadline.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StoreError::Cancelled | StoreError::DeadlineExceeded)
    }

    pub(crate) fn no_rows() -> Self {
        CanonicalError::new(ErrorKind::NoRows, ErrorKind::NoRows.as_str()).into()
    }

    pub(crate) fn key_not_found(key: &str) -> Self {
        CanonicalError::new(ErrorKind::KeyNotFound, format!("key {key:?} does not exist")).into()
    }
}

/// Map a five-character SQLSTATE to its canonical constraint kind.
#[must_use]
pub fn classify_sqlstate(code: &str) -> Option<ErrorKind> {
    match code {
        "23514" => Some(ErrorKind::CheckViolation),
        "23505" => Some(ErrorKind::UniqueViolation),
        "23502" => Some(ErrorKind::NotNullViolation),
        "23503" => Some(ErrorKind::ForeignKeyViolation),
        _ => None,
    }
}

/// Classify a Postgres failure.
///
/// Constraint violations become [`StoreError::Canonical`] carrying the server's
/// diagnostic text; every other error is returned unchanged.
#[cfg(feature = "postgres")]
#[must_use]
pub fn normalize_postgres(err: tokio_postgres::Error) -> StoreError {
    let kind = err.code().map(SqlState::code).and_then(classify_sqlstate);
    match kind {
        Some(kind) => {
            let message = err
                .as_db_error()
                .map_or_else(|| err.to_string(), ToString::to_string);
            CanonicalError::wrap(kind, message, err).into()
        }
        None => StoreError::PostgresError(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_constraint_codes() {
        assert_eq!(classify_sqlstate("23514"), Some(ErrorKind::CheckViolation));
        assert_eq!(classify_sqlstate("23505"), Some(ErrorKind::UniqueViolation));
        assert_eq!(classify_sqlstate("23502"), Some(ErrorKind::NotNullViolation));
        assert_eq!(
            classify_sqlstate("23503"),
            Some(ErrorKind::ForeignKeyViolation)
        );
    }

    #[test]
    fn leaves_unknown_codes_unclassified() {
        assert_eq!(classify_sqlstate("40001"), None);
        assert_eq!(classify_sqlstate("23000"), None);
        assert_eq!(classify_sqlstate(""), None);
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn sqlstate_constants_agree_with_classifier() {
        assert_eq!(
            classify_sqlstate(SqlState::UNIQUE_VIOLATION.code()),
            Some(ErrorKind::UniqueViolation)
        );
        assert_eq!(
            classify_sqlstate(SqlState::CHECK_VIOLATION.code()),
            Some(ErrorKind::CheckViolation)
        );
        assert_eq!(
            classify_sqlstate(SqlState::NOT_NULL_VIOLATION.code()),
            Some(ErrorKind::NotNullViolation)
        );
        assert_eq!(
            classify_sqlstate(SqlState::FOREIGN_KEY_VIOLATION.code()),
            Some(ErrorKind::ForeignKeyViolation)
        );
    }

    #[test]
    fn canonical_error_keeps_backend_message() {
        let source = std::io::Error::other("duplicate key value violates unique constraint");
        let err: StoreError = CanonicalError::wrap(
            ErrorKind::UniqueViolation,
            source.to_string(),
            source,
        )
        .into();

        assert!(err.is(ErrorKind::UniqueViolation));
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn cancellation_is_not_a_canonical_kind() {
        assert!(StoreError::Cancelled.is_cancellation());
        assert!(StoreError::DeadlineExceeded.is_cancellation());
        assert_eq!(StoreError::Cancelled.kind(), None);
        assert!(!StoreError::no_rows().is_cancellation());
        assert!(StoreError::no_rows().is(ErrorKind::NoRows));
        assert!(StoreError::key_not_found("k").is(ErrorKind::KeyNotFound));
    }
}
