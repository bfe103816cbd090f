use std::time::Duration;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::record::{OutboxRecord, RecordId};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;

/// Durable access to the outbox table.
///
/// Implementors back the worker pool; the write path talks to the
/// backend's transactional insert directly so the outbox row commits with
/// the business change.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Up to `limit` deliverable records, oldest first: PENDING rows plus
    /// FAILED rows that still have retry budget. No global ordering is
    /// guaranteed beyond `created_at` ascending.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, RelayError>;

    /// Take exclusive ownership of one record inside a short internal
    /// transaction. Returns [`RelayError::NotClaimable`] when the row is
    /// missing, soft-deleted, or locked by another worker.
    ///
    /// The claim holds its row lock until it is consumed; dropping it
    /// without consuming rolls the transaction back and leaves the record
    /// untouched.
    async fn claim(&self, id: RecordId) -> Result<Box<dyn OutboxClaim>, RelayError>;

    /// Remove PUBLISHED records whose `published_at` is older than the
    /// window. Returns the number of records swept.
    async fn cleanup(&self, older_than: Duration) -> Result<u64, RelayError>;
}

/// Exclusive ownership of one outbox record.
///
/// Exactly one consuming call decides the claim's fate: `mark_published`
/// and `mark_failed` mutate and commit, `release` commits without
/// mutating (the idempotent no-op paths), and dropping the claim rolls
/// back.
#[async_trait]
pub trait OutboxClaim: Send {
    /// The row as read under the lock. May differ from the polled
    /// snapshot that led to this claim.
    fn record(&self) -> &OutboxRecord;

    /// Transition to PUBLISHED and stamp `published_at`. A record that is
    /// already PUBLISHED is left untouched.
    async fn mark_published(self: Box<Self>) -> Result<(), RelayError>;

    /// Transition to FAILED, record the error, and increment
    /// `retry_count` by one.
    async fn mark_failed(self: Box<Self>, error: &str) -> Result<(), RelayError>;

    /// Commit without mutating the record.
    async fn release(self: Box<Self>) -> Result<(), RelayError>;
}
