use std::time::Duration;

use thiserror::Error;

/// Error type shared by every relay subsystem.
///
/// Each variant is a tag the callers branch on; nothing in the crate
/// inspects formatted error text. The store maps backend errors onto
/// `Transient`/`Permanent`, contention surfaces as `NotClaimable`, and the
/// publisher adds `BreakerOpen`/`Cancelled`/`Timeout` on top.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed input: empty identifiers, missing payload, bad config.
    /// Never retried and never recorded against the circuit breaker.
    #[error("validation error: {0}")]
    Validation(String),

    /// Recoverable infrastructure failure (connection timeout, bus
    /// unavailable). Retried within the publish budget.
    #[error("transient error: {0}")]
    Transient(String),

    /// Non-recoverable failure (constraint violation, serialization
    /// failure). Retrying will not help.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The record is missing, soft-deleted, or locked by another worker.
    /// Expected under contention; swallowed by the worker pool.
    #[error("record is not claimable")]
    NotClaimable,

    /// The circuit breaker is open and the call was short-circuited.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The per-record processing deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::BreakerOpen | Self::Timeout(_)
        )
    }

    /// Stable label for the `events_failed_total{error_type}` metric.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::NotClaimable => "not_claimable",
            Self::BreakerOpen => "breaker_open",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Map a sqlx error onto the relay's tagged error kinds.
///
/// Constraint violations (unique, not-null, check) are permanent; row
/// lookups that miss are the caller's concern; everything else is treated
/// as transient infrastructure trouble.
#[cfg(feature = "postgres")]
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RelayError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            match code.as_deref() {
                // 23xxx: integrity constraint violations
                Some(code) if code.starts_with("23") => {
                    RelayError::Permanent(format!("constraint violation: {db_err}"))
                }
                _ => RelayError::Transient(format!("database error: {db_err}")),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RelayError::Transient(format!("database unavailable: {err}"))
        }
        _ => RelayError::Transient(format!("database error: {err}")),
    }
}
