//! Prometheus metrics instrumentation for the relay.
//!
//! All metrics are conditionally compiled behind the `metrics` feature
//! flag and registered on a crate-local registry.
//!
//! # Metrics
//!
//! ## Counters
//! - `txrelay_events_processed_total` - Events processed by the worker pool
//! - `txrelay_events_published_total` - Events delivered to the bus
//! - `txrelay_events_failed_total` - Events that failed processing
//! - `txrelay_events_retried_total` - Events that entered a retry
//! - `txrelay_circuit_breaker_trips_total` - Breaker state transitions
//!
//! ## Histograms
//! - `txrelay_event_processing_duration_seconds` - Per-record processing time
//! - `txrelay_event_publishing_duration_seconds` - Bus round-trip time
//! - `txrelay_retry_delay_duration_seconds` - Inter-attempt delays
//!
//! ## Gauges
//! - `txrelay_worker_pool_size` - Configured worker count
//! - `txrelay_events_in_queue` - Records per status seen at the last poll
//! - `txrelay_circuit_breaker_state` - 0=closed, 1=half-open, 2=open
//! - `txrelay_active_workers` - Workers currently processing a record
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Crate-local Prometheus registry for relay metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for events processed by the worker pool.
///
/// Labels:
/// - `status`: processing outcome (published, already_published,
///   permanently_failed)
/// - `event_type`: the event discriminator
pub static EVENTS_PROCESSED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "txrelay_events_processed_total",
        "Total number of events processed by the worker pool",
    );
    CounterVec::new(opts, &["status", "event_type"])
        .expect("txrelay_events_processed_total metric creation failed")
});

/// Counter for events successfully delivered to the bus.
///
/// Labels:
/// - `topic`: the destination topic
/// - `event_type`: the event discriminator
pub static EVENTS_PUBLISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "txrelay_events_published_total",
        "Total number of events successfully published to the bus",
    );
    CounterVec::new(opts, &["topic", "event_type"])
        .expect("txrelay_events_published_total metric creation failed")
});

/// Counter for events that failed to be processed or published.
///
/// Labels:
/// - `error_type`: tagged error kind (transient, permanent, timeout, ...)
/// - `event_type`: the event discriminator
pub static EVENTS_FAILED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "txrelay_events_failed_total",
        "Total number of events that failed to be published",
    );
    CounterVec::new(opts, &["error_type", "event_type"])
        .expect("txrelay_events_failed_total metric creation failed")
});

/// Counter for events that entered a retry.
///
/// Labels:
/// - `retry_count`: the attempt number the record moved to
/// - `event_type`: the event discriminator
pub static EVENTS_RETRIED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "txrelay_events_retried_total",
        "Total number of events that were retried",
    );
    CounterVec::new(opts, &["retry_count", "event_type"])
        .expect("txrelay_events_retried_total metric creation failed")
});

/// Counter for circuit breaker state transitions.
pub static CIRCUIT_BREAKER_TRIPS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "txrelay_circuit_breaker_trips_total",
        "Total number of circuit breaker state changes",
    );
    CounterVec::new(opts, &["from_state", "to_state"])
        .expect("txrelay_circuit_breaker_trips_total metric creation failed")
});

/// Histogram for per-record processing time in the worker pool.
pub static EVENT_PROCESSING_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "txrelay_event_processing_duration_seconds",
        "Time spent processing events",
    );
    HistogramVec::new(opts, &["event_type"])
        .expect("txrelay_event_processing_duration_seconds metric creation failed")
});

/// Histogram for bus round-trip time per publish call.
pub static EVENT_PUBLISHING_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "txrelay_event_publishing_duration_seconds",
        "Time spent publishing events to the bus",
    );
    HistogramVec::new(opts, &["topic", "event_type"])
        .expect("txrelay_event_publishing_duration_seconds metric creation failed")
});

/// Histogram for the delays slept between publish attempts.
pub static RETRY_DELAY_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "txrelay_retry_delay_duration_seconds",
        "Duration of retry delays",
    )
    .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    HistogramVec::new(opts, &["retry_attempt"])
        .expect("txrelay_retry_delay_duration_seconds metric creation failed")
});

/// Gauge for the configured worker pool size.
pub static WORKER_POOL_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "txrelay_worker_pool_size",
        "Current size of the worker pool",
    )
    .expect("txrelay_worker_pool_size metric creation failed")
});

/// Gauge for queue depth by record status, sampled at each poll.
pub static EVENTS_IN_QUEUE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "txrelay_events_in_queue",
        "Number of events currently in the processing queue",
    );
    IntGaugeVec::new(opts, &["status"])
        .expect("txrelay_events_in_queue metric creation failed")
});

/// Gauge for the circuit breaker state (0=closed, 1=half-open, 2=open).
pub static CIRCUIT_BREAKER_STATE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "txrelay_circuit_breaker_state",
        "Current state of the circuit breaker (0=Closed, 1=Half-Open, 2=Open)",
    )
    .expect("txrelay_circuit_breaker_state metric creation failed")
});

/// Gauge for workers currently processing a record.
pub static ACTIVE_WORKERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "txrelay_active_workers",
        "Number of currently active workers",
    )
    .expect("txrelay_active_workers metric creation failed")
});

/// Initialize all metrics by registering them with the crate registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(EVENTS_PROCESSED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(EVENTS_PUBLISHED_TOTAL.clone()),
        Box::new(EVENTS_FAILED_TOTAL.clone()),
        Box::new(EVENTS_RETRIED_TOTAL.clone()),
        Box::new(CIRCUIT_BREAKER_TRIPS_TOTAL.clone()),
        Box::new(EVENT_PROCESSING_DURATION_SECONDS.clone()),
        Box::new(EVENT_PUBLISHING_DURATION_SECONDS.clone()),
        Box::new(RETRY_DELAY_DURATION_SECONDS.clone()),
        Box::new(WORKER_POOL_SIZE.clone()),
        Box::new(EVENTS_IN_QUEUE.clone()),
        Box::new(CIRCUIT_BREAKER_STATE.clone()),
        Box::new(ACTIVE_WORKERS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_event_processed(status: &str, event_type: &str) {
    EVENTS_PROCESSED_TOTAL
        .with_label_values(&[status, event_type])
        .inc();
}

pub fn record_event_published(topic: &str, event_type: &str) {
    EVENTS_PUBLISHED_TOTAL
        .with_label_values(&[topic, event_type])
        .inc();
}

pub fn record_event_failed(error_type: &str, event_type: &str) {
    EVENTS_FAILED_TOTAL
        .with_label_values(&[error_type, event_type])
        .inc();
}

pub fn record_event_retried(retry_count: &str, event_type: &str) {
    EVENTS_RETRIED_TOTAL
        .with_label_values(&[retry_count, event_type])
        .inc();
}

pub fn record_breaker_trip(from_state: &str, to_state: &str) {
    CIRCUIT_BREAKER_TRIPS_TOTAL
        .with_label_values(&[from_state, to_state])
        .inc();
}

pub fn observe_processing_duration(event_type: &str, duration_secs: f64) {
    EVENT_PROCESSING_DURATION_SECONDS
        .with_label_values(&[event_type])
        .observe(duration_secs);
}

pub fn observe_publishing_duration(topic: &str, event_type: &str, duration_secs: f64) {
    EVENT_PUBLISHING_DURATION_SECONDS
        .with_label_values(&[topic, event_type])
        .observe(duration_secs);
}

pub fn observe_retry_delay(retry_attempt: &str, duration_secs: f64) {
    RETRY_DELAY_DURATION_SECONDS
        .with_label_values(&[retry_attempt])
        .observe(duration_secs);
}

pub fn set_worker_pool_size(size: i64) {
    WORKER_POOL_SIZE.set(size);
}

pub fn set_events_in_queue(status: &str, count: i64) {
    EVENTS_IN_QUEUE.with_label_values(&[status]).set(count);
}

pub fn set_breaker_state(state: i64) {
    CIRCUIT_BREAKER_STATE.set(state);
}

pub fn inc_active_workers() {
    ACTIVE_WORKERS.inc();
}

pub fn dec_active_workers() {
    ACTIVE_WORKERS.dec();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

/// Serve the scrape endpoint until the task is aborted.
pub async fn serve(config: crate::config::MetricsConfig) -> anyhow::Result<()> {
    use axum::routing::get;

    let app = axum::Router::new().route(&config.path, get(scrape_handler));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, path = %config.path, "metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn scrape_handler() -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    match gather_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            tracing::error!("failed to gather metrics: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response()
        }
    }
}
