//! Tracing and telemetry instrumentation for the relay.
//!
//! This module provides helper functions for creating tracing spans and
//! recording metrics during record lifecycle events. All functions work
//! both with and without the `metrics` feature flag: tracing output is
//! always emitted, Prometheus samples only when the feature is enabled,
//! so the core modules never branch on the feature themselves.

use std::time::Duration;

use tracing::{info_span, Span};

use crate::breaker::BreakerState;
use crate::record::OutboxRecord;

/// Create a tracing span for a publish call.
#[must_use]
pub fn publish_span(record: &OutboxRecord) -> Span {
    info_span!(
        "txrelay.publish",
        record_id = %record.id,
        event_type = %record.event_type,
        aggregate_id = %record.aggregate_id,
    )
}

/// Create a tracing span for claiming and processing one record.
#[must_use]
pub fn process_span(record: &OutboxRecord) -> Span {
    info_span!(
        "txrelay.process",
        record_id = %record.id,
        event_type = %record.event_type,
        retry_count = record.retry_count,
    )
}

/// Create a tracing span for the transactional enqueue path.
#[must_use]
pub fn enqueue_span(aggregate_type: impl AsRef<str>, event_type: impl AsRef<str>) -> Span {
    info_span!(
        "txrelay.enqueue",
        aggregate_type = %aggregate_type.as_ref(),
        event_type = %event_type.as_ref(),
    )
}

/// Initialize the metrics registry. No-op without the `metrics` feature.
pub fn init_metrics() -> anyhow::Result<()> {
    #[cfg(feature = "metrics")]
    crate::metrics::init_metrics()?;
    Ok(())
}

/// Record a processing outcome for one record.
pub fn record_event_processed(status: &str, event_type: &str) {
    tracing::debug!(status, event_type, "event processed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_processed(status, event_type);
}

/// Record a successful delivery to the bus.
pub fn record_event_published(topic: &str, event_type: &str) {
    tracing::info!(topic, event_type, "event published");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_published(topic, event_type);
}

/// Record a processing or publishing failure.
pub fn record_event_failed(error_type: &str, event_type: &str) {
    tracing::warn!(error_type, event_type, "event failed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_failed(error_type, event_type);
}

/// Record that a record moved to its next retry attempt.
pub fn record_event_retried(retry_count: u32, event_type: &str) {
    tracing::info!(retry_count, event_type, "event will be retried");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_retried(&retry_count.to_string(), event_type);
}

/// Record a circuit breaker transition and update the state gauge.
pub fn record_breaker_trip(from: BreakerState, to: BreakerState) {
    tracing::info!(from = %from, to = %to, "circuit breaker state changed");

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_breaker_trip(from.as_str(), to.as_str());
        crate::metrics::set_breaker_state(to.gauge_value());
    }
}

/// Update the breaker state gauge without a transition.
pub fn set_breaker_state(state: BreakerState) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_breaker_state(state.gauge_value());
    #[cfg(not(feature = "metrics"))]
    let _ = state;
}

/// Observe the wall time spent processing one record.
pub fn observe_processing_duration(event_type: &str, duration: Duration) {
    tracing::debug!(
        event_type,
        duration_secs = duration.as_secs_f64(),
        "event processing finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_processing_duration(event_type, duration.as_secs_f64());
}

/// Observe the bus round-trip time of a publish call.
pub fn observe_publishing_duration(topic: &str, event_type: &str, duration: Duration) {
    tracing::debug!(
        topic,
        event_type,
        duration_secs = duration.as_secs_f64(),
        "publish call finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_publishing_duration(topic, event_type, duration.as_secs_f64());
}

/// Observe the delay slept before the given retry attempt.
pub fn observe_retry_delay(retry_attempt: u32, delay: Duration) {
    tracing::debug!(
        retry_attempt,
        delay_ms = delay.as_millis() as u64,
        "sleeping before retry"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_retry_delay(&retry_attempt.to_string(), delay.as_secs_f64());
}

/// Publish the configured worker pool size.
pub fn set_worker_pool_size(size: usize) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_worker_pool_size(size as i64);
    #[cfg(not(feature = "metrics"))]
    let _ = size;
}

/// Publish the queue depth sampled at the last poll.
pub fn set_events_in_queue(status: &str, count: usize) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_events_in_queue(status, count as i64);
    #[cfg(not(feature = "metrics"))]
    let _ = (status, count);
}

/// Mark one worker as busy.
pub fn inc_active_workers() {
    #[cfg(feature = "metrics")]
    crate::metrics::inc_active_workers();
}

/// Mark one worker as idle again.
pub fn dec_active_workers() {
    #[cfg(feature = "metrics")]
    crate::metrics::dec_active_workers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventSpec;
    use serde_json::json;

    fn record() -> OutboxRecord {
        OutboxRecord::from_spec(EventSpec::new(
            "A1",
            "Order",
            "OrderCreated",
            json!({"total": 1}),
        ))
        .unwrap()
    }

    #[test]
    fn test_publish_span() {
        let span = publish_span(&record());
        assert_eq!(span.metadata().unwrap().name(), "txrelay.publish");
    }

    #[test]
    fn test_process_span() {
        let span = process_span(&record());
        assert_eq!(span.metadata().unwrap().name(), "txrelay.process");
    }

    #[test]
    fn test_enqueue_span() {
        let span = enqueue_span("Order", "OrderCreated");
        assert_eq!(span.metadata().unwrap().name(), "txrelay.enqueue");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        init_metrics().unwrap();
        record_event_processed("published", "OrderCreated");
        record_event_published("txrelay.events", "OrderCreated");
        record_event_failed("transient", "OrderCreated");
        record_event_retried(1, "OrderCreated");
        observe_processing_duration("OrderCreated", Duration::from_millis(5));
        observe_publishing_duration("txrelay.events", "OrderCreated", Duration::from_millis(5));
        observe_retry_delay(1, Duration::from_millis(50));
        set_worker_pool_size(3);
        set_events_in_queue("pending", 2);
        inc_active_workers();
        dec_active_workers();
    }
}
