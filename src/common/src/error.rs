use thiserror::Error;

/// Sentinel errors shared by the index and data-store subsystems.
///
/// Callers test for a sentinel by downcasting an `anyhow::Error`, see the
/// predicates below. Anything not listed here is treated as a transient
/// failure and surfaced to the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("need recovery series wal")]
    NeedRecoveryWal,

    #[error("resource already closed")]
    Closed,

    #[error("timestamp {timestamp} out of range [{start}, {end}]")]
    TimestampOutOfRange {
        timestamp: i64,
        start: i64,
        end: i64,
    },

    #[error("invalid date key: {0}")]
    InvalidDateKey(String),

    #[error("invalid family name: {0}")]
    InvalidFamilyName(String),
}

/// is_not_found returns true if the error chain carries the NotFound sentinel.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound))
}

/// is_closed returns true if the error chain carries the Closed sentinel.
pub fn is_closed(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Closed))
}
