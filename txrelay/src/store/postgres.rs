use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{map_sqlx_err, RelayError};
use crate::record::{OutboxRecord, OutboxStatus, RecordId};
use crate::store::{OutboxClaim, OutboxStore};

const RECORD_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, metadata, \
     status, created_at, published_at, retry_count, error_message";

/// PostgreSQL-backed outbox store.
///
/// Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so contending workers
/// fail fast with `NotClaimable` instead of queueing on the row lock.
#[derive(Clone, Debug)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    max_retries: u32,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a record within the caller's transaction.
    ///
    /// The write path uses this so the outbox row commits atomically with
    /// the business change. Rejects records that are not fully populated.
    pub async fn insert(conn: &mut PgConnection, record: &OutboxRecord) -> Result<(), RelayError> {
        record.validate()?;

        sqlx::query(
            r#"
            INSERT INTO outbox (
                id, aggregate_id, aggregate_type, event_type, payload, metadata,
                status, created_at, published_at, retry_count, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id.0)
        .bind(&record.aggregate_id)
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(&record.metadata)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.published_at)
        .bind(record.retry_count as i32)
        .bind(&record.error_message)
        .execute(conn)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetch one record by id, ignoring soft-deleted rows.
    pub async fn get(&self, id: RecordId) -> Result<Option<OutboxRecord>, RelayError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Every event recorded for one aggregate, oldest first.
    pub async fn events_for_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Vec<OutboxRecord>, RelayError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox \
             WHERE aggregate_id = $1 AND aggregate_type = $2 AND deleted_at IS NULL \
             ORDER BY created_at ASC"
        ))
        .bind(aggregate_id)
        .bind(aggregate_type)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_record).collect()
    }

    /// FAILED records, oldest first, regardless of retry budget.
    pub async fn failed(&self, limit: usize) -> Result<Vec<OutboxRecord>, RelayError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox \
             WHERE status = 'failed' AND deleted_at IS NULL \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, RelayError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox \
             WHERE deleted_at IS NULL \
               AND (status = 'pending' OR (status = 'failed' AND retry_count < $2)) \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .bind(self.max_retries as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn claim(&self, id: RecordId) -> Result<Box<dyn OutboxClaim>, RelayError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox \
             WHERE id = $1 AND deleted_at IS NULL \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        // Missing row and row locked by another worker are the same
        // signal to the caller.
        let Some(row) = row else {
            return Err(RelayError::NotClaimable);
        };
        let record = row_to_record(&row)?;

        Ok(Box::new(PostgresClaim { record, tx }))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64, RelayError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| RelayError::validation(format!("invalid retention window: {err}")))?;

        let result = sqlx::query(
            "UPDATE outbox SET deleted_at = NOW() \
             WHERE status = 'published' AND published_at < $1 AND deleted_at IS NULL",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let swept = result.rows_affected();
        if swept > 0 {
            debug!(swept, "swept published records past retention");
        }
        Ok(swept)
    }
}

struct PostgresClaim {
    record: OutboxRecord,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OutboxClaim for PostgresClaim {
    fn record(&self) -> &OutboxRecord {
        &self.record
    }

    async fn mark_published(mut self: Box<Self>) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE outbox SET status = 'published', published_at = NOW() \
             WHERE id = $1 AND status <> 'published'",
        )
        .bind(self.record.id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        self.tx.commit().await.map_err(map_sqlx_err)
    }

    async fn mark_failed(mut self: Box<Self>, error: &str) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE outbox SET status = 'failed', error_message = $2, \
             retry_count = retry_count + 1 \
             WHERE id = $1",
        )
        .bind(self.record.id.0)
        .bind(error)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        self.tx.commit().await.map_err(map_sqlx_err)
    }

    async fn release(self: Box<Self>) -> Result<(), RelayError> {
        self.tx.commit().await.map_err(map_sqlx_err)
    }
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, RelayError> {
    let id: Uuid = row.try_get("id").map_err(map_sqlx_err)?;
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(map_sqlx_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_err)?;
    let published_at: Option<DateTime<Utc>> =
        row.try_get("published_at").map_err(map_sqlx_err)?;

    Ok(OutboxRecord {
        id: RecordId(id),
        aggregate_id: row.try_get("aggregate_id").map_err(map_sqlx_err)?,
        aggregate_type: row.try_get("aggregate_type").map_err(map_sqlx_err)?,
        event_type: row.try_get("event_type").map_err(map_sqlx_err)?,
        payload: row.try_get("payload").map_err(map_sqlx_err)?,
        metadata: row.try_get("metadata").map_err(map_sqlx_err)?,
        status: status.parse::<OutboxStatus>()?,
        created_at,
        published_at,
        retry_count: retry_count.max(0) as u32,
        error_message: row.try_get("error_message").map_err(map_sqlx_err)?,
    })
}
