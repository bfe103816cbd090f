//! Test support for txrelay: an in-memory outbox store with claim
//! semantics matching the PostgreSQL backend, and a scripted bus
//! transport that records what it delivers.

mod publisher;
mod store;

pub use publisher::ScriptedTransport;
pub use store::{BusinessState, InMemoryOutboxStore};

use serde_json::json;
use txrelay::record::EventSpec;

/// A ready-made order event spec for tests.
pub fn order_created_spec(aggregate_id: &str) -> EventSpec {
    EventSpec::new(
        aggregate_id,
        "Order",
        "OrderCreated",
        json!({"order_id": aggregate_id, "total": 100}),
    )
}
