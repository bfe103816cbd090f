//! Atomicity of the transactional write path: the business mutation and
//! the outbox insert commit together or not at all.

use serde_json::json;

use txrelay::error::RelayError;
use txrelay::record::{EventSpec, OutboxStatus};
use txrelay_testkit::InMemoryOutboxStore;

#[test]
fn enqueue_commits_business_write_and_outbox_record_together() {
    let store = InMemoryOutboxStore::new(3);

    let (order_id, outbox_id) = store
        .enqueue(
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
        )
        .unwrap();

    assert_eq!(order_id, "order-1");
    assert!(store.business_state().contains_key("order-1"));

    let record = store.get(outbox_id).unwrap();
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.aggregate_id, "order-1");
    assert_eq!(record.event_type, "OrderCreated");
}

#[test]
fn committed_business_rows_and_outbox_rows_stay_in_lockstep() {
    let store = InMemoryOutboxStore::new(3);

    for i in 0..5 {
        store
            .enqueue(
                move |state| {
                    state.insert(format!("order-{i}"), json!({"total": i}));
                    Ok(format!("order-{i}"))
                },
                |order_id| {
                    EventSpec::new(order_id.clone(), "Order", "OrderCreated", json!({"n": 1}))
                },
            )
            .unwrap();
    }

    assert_eq!(store.business_state().len(), 5);
    assert_eq!(store.record_count(), 5);
}

#[test]
fn failed_mutation_rolls_back_everything() {
    let store = InMemoryOutboxStore::new(3);

    let result = store.enqueue(
        |state| -> Result<String, RelayError> {
            state.insert("order-ghost".to_string(), json!({}));
            Err(RelayError::validation("order number is required"))
        },
        |order_id: &String| EventSpec::new(order_id.clone(), "Order", "OrderCreated", json!({})),
    );

    assert!(matches!(result, Err(RelayError::Validation(_))));
    assert!(store.business_state().is_empty());
    assert_eq!(store.record_count(), 0);
}

#[test]
fn invalid_event_spec_rolls_back_the_business_write() {
    let store = InMemoryOutboxStore::new(3);

    // The mutation succeeds, but the record factory rejects the spec
    let result = store.enqueue(
        |state| {
            state.insert("order-2".to_string(), json!({"total": 5}));
            Ok("order-2".to_string())
        },
        |_| EventSpec::new("", "Order", "OrderCreated", json!({"total": 5})),
    );

    assert!(matches!(result, Err(RelayError::Validation(_))));
    assert!(store.business_state().is_empty());
    assert_eq!(store.record_count(), 0);
}

#[test]
fn failed_outbox_insert_rolls_back_the_business_write() {
    let store = InMemoryOutboxStore::new(3);
    store.fail_inserts(true);

    let result = store.enqueue(
        |state| {
            state.insert("order-3".to_string(), json!({"total": 7}));
            Ok("order-3".to_string())
        },
        |order_id| EventSpec::new(order_id.clone(), "Order", "OrderCreated", json!({"n": 3})),
    );

    assert!(matches!(result, Err(RelayError::Permanent(_))));
    // Neither the business row nor the outbox row is visible
    assert!(store.business_state().is_empty());
    assert_eq!(store.record_count(), 0);

    store.fail_inserts(false);
    store
        .enqueue(
            |state| {
                state.insert("order-3".to_string(), json!({"total": 7}));
                Ok("order-3".to_string())
            },
            |order_id| EventSpec::new(order_id.clone(), "Order", "OrderCreated", json!({"n": 3})),
        )
        .unwrap();
    assert_eq!(store.record_count(), 1);
}

#[test]
fn direct_insert_with_empty_aggregate_id_leaves_no_row() {
    let store = InMemoryOutboxStore::new(3);

    let err = store
        .insert_spec(EventSpec::new("", "Order", "OrderCreated", json!({"n": 1})))
        .unwrap_err();

    assert!(matches!(err, RelayError::Validation(_)));
    assert_eq!(store.record_count(), 0);
}
