//! Minimal relay example: in-memory store, simulated bus, real worker
//! pool.
//!
//! Run with:
//! ```bash
//! cargo run --example simple_relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use txrelay::{BusPublisher, EventSpec, PublisherConfig, WorkerConfig, WorkerPool};
use txrelay_testkit::InMemoryOutboxStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(InMemoryOutboxStore::default());

    // The write path: a business mutation and the outbox insert commit
    // together
    let (order_id, outbox_id) = store.enqueue(
        |state| {
            state.insert("order-1".to_string(), json!({"total": 100}));
            Ok("order-1".to_string())
        },
        |order_id| {
            EventSpec::new(
                order_id.clone(),
                "Order",
                "OrderCreated",
                json!({"order_id": order_id, "total": 100}),
            )
        },
    )?;
    println!("enqueued {order_id} as outbox record {outbox_id}");

    // No brokers configured: the publisher logs and simulates latency
    let publisher = Arc::new(BusPublisher::simulated(PublisherConfig::default()));
    let pool = WorkerPool::new(
        WorkerConfig {
            interval_ms: 200,
            ..Default::default()
        },
        store.clone(),
        publisher,
    );

    pool.start().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    pool.shutdown().await;

    let record = store.get(outbox_id).expect("record exists");
    println!("record {} is now {}", record.id, record.status);
    Ok(())
}
