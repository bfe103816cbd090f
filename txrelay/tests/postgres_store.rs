//! Integration tests for the PostgreSQL outbox store: insert/lookup
//! round-trips, claim transitions, and retention cleanup against a real
//! database.
//!
//! Requires a running Postgres instance with the txrelay schema applied
//! (`migrations/001_initial_schema.sql`).
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use txrelay::record::{EventSpec, OutboxRecord, OutboxStatus};
use txrelay::store::postgres::PostgresOutboxStore;
use txrelay::store::OutboxStore;

async fn connect() -> PgPool {
    PgPool::connect(&std::env::var("DATABASE_URL").expect("DATABASE_URL required"))
        .await
        .expect("connect")
}

/// Insert a record for the given aggregate through the store's
/// transactional insert.
async fn insert_record(pool: &PgPool, aggregate_id: &str, event_type: &str) -> OutboxRecord {
    let record = OutboxRecord::from_spec(EventSpec::new(
        aggregate_id,
        "Order",
        event_type,
        json!({"order_id": aggregate_id}),
    ))
    .expect("valid spec");

    let mut conn = pool.acquire().await.expect("acquire");
    PostgresOutboxStore::insert(&mut conn, &record)
        .await
        .expect("insert");
    record
}

/// Hard-delete everything this test created, soft-deleted rows included.
async fn cleanup_aggregate(pool: &PgPool, aggregate_id: &str) {
    sqlx::query("DELETE FROM outbox WHERE aggregate_id = $1")
        .bind(aggregate_id)
        .execute(pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn insert_get_and_aggregate_lookup_round_trip() {
    let pool = connect().await;
    let store = PostgresOutboxStore::new(pool.clone(), 3);
    let aggregate_id = format!("test-agg-{}", Uuid::new_v4());

    let created = insert_record(&pool, &aggregate_id, "OrderCreated").await;
    let shipped = insert_record(&pool, &aggregate_id, "OrderShipped").await;

    // get() returns the row as inserted, payload byte-identical
    let fetched = store
        .get(created.id)
        .await
        .expect("get")
        .expect("record exists");
    assert_eq!(fetched.aggregate_id, aggregate_id);
    assert_eq!(fetched.event_type, "OrderCreated");
    assert_eq!(fetched.status, OutboxStatus::Pending);
    assert_eq!(fetched.payload, created.payload);
    assert_eq!(fetched.retry_count, 0);

    // Unknown ids are None, not an error
    assert!(store
        .get(txrelay::record::RecordId::new())
        .await
        .expect("get unknown")
        .is_none());

    // Aggregate lookup returns both events, oldest first
    let events = store
        .events_for_aggregate(&aggregate_id, "Order")
        .await
        .expect("events_for_aggregate");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].id, created.id);
    assert_eq!(events[1].id, shipped.id);

    // A different aggregate_type does not match
    assert!(store
        .events_for_aggregate(&aggregate_id, "Invoice")
        .await
        .expect("events_for_aggregate")
        .is_empty());

    cleanup_aggregate(&pool, &aggregate_id).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn failed_lookup_sees_marked_rows_that_pending_excludes() {
    let pool = connect().await;
    let store = PostgresOutboxStore::new(pool.clone(), 1);
    let aggregate_id = format!("test-failed-{}", Uuid::new_v4());

    let record = insert_record(&pool, &aggregate_id, "OrderCreated").await;

    let claim = store.claim(record.id).await.expect("claim");
    claim
        .mark_failed("giving up after 1 attempts: bus unavailable")
        .await
        .expect("mark_failed");

    // Exhausted for the poller (max_retries = 1), but listed as failed
    let pending = store.pending(50).await.expect("pending");
    assert!(pending.iter().all(|r| r.id != record.id));

    let failed = store.failed(50).await.expect("failed");
    let row = failed
        .iter()
        .find(|r| r.id == record.id)
        .expect("failed row listed");
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(row.error_message.contains("giving up"));

    cleanup_aggregate(&pool, &aggregate_id).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn claim_publish_and_cleanup_full_lifecycle() {
    let pool = connect().await;
    let store = PostgresOutboxStore::new(pool.clone(), 3);
    let aggregate_id = format!("test-lifecycle-{}", Uuid::new_v4());

    let record = insert_record(&pool, &aggregate_id, "OrderCreated").await;

    // Freshly inserted rows are deliverable
    let pending = store.pending(50).await.expect("pending");
    assert!(pending.iter().any(|r| r.id == record.id));

    let claim = store.claim(record.id).await.expect("claim");
    assert_eq!(claim.record().status, OutboxStatus::Pending);
    claim.mark_published().await.expect("mark_published");

    let published = store
        .get(record.id)
        .await
        .expect("get")
        .expect("record exists");
    assert_eq!(published.status, OutboxStatus::Published);
    assert!(published.published_at.is_some());

    // Published rows leave the pending set
    let pending = store.pending(50).await.expect("pending");
    assert!(pending.iter().all(|r| r.id != record.id));

    // Retention sweep soft-deletes it; get() no longer sees the row
    tokio::time::sleep(Duration::from_millis(50)).await;
    let swept = store
        .cleanup(Duration::from_millis(1))
        .await
        .expect("cleanup");
    assert!(swept >= 1);
    assert!(store.get(record.id).await.expect("get").is_none());

    cleanup_aggregate(&pool, &aggregate_id).await;
}
