//! txrelay - Transactional outbox relay.
//!
//! A crate implementing the transactional outbox pattern: events produced
//! by a business transaction on a relational store are committed together
//! with the business change, then delivered at-least-once to an external
//! message bus by a polling worker pool.
//!
//! # Core Concepts
//!
//! - **Record**: The [`OutboxRecord`] is the single durable entity: one
//!   not-yet-delivered event, created by the write path and moved through
//!   PENDING → PUBLISHED/FAILED by the workers.
//!
//! - **Enqueue**: The [`EnqueueService`] runs a caller-supplied business
//!   mutation and the outbox insert in one database transaction, so either
//!   both are durable or neither is.
//!
//! - **Store**: The [`OutboxStore`] trait abstracts outbox persistence:
//!   polling for deliverable records, claiming one under a row-level lock,
//!   and retention cleanup.
//!
//! - **Publisher**: The [`BusPublisher`] serialises records to the bus
//!   payload and layers bounded retry with exponential backoff and jitter,
//!   plus an optional [`CircuitBreaker`], over a [`BusTransport`].
//!
//! - **Pool**: The [`WorkerPool`] ties it together: a polling task fans
//!   records out to worker tasks over a bounded channel, and each worker
//!   drives the per-record state machine.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx (requires database setup)
//! - `metrics` - Prometheus metrics support (default)
//! - `kafka` - Kafka bus transport via rdkafka; without it the publisher
//!   runs in simulation mode
//!
//! # Quick Start
//!
//! The simplest way to exercise the relay is the in-memory store from
//! `txrelay-testkit` together with the simulated bus:
//!
//! ```ignore
//! use std::sync::Arc;
//! use txrelay::{BusPublisher, PublisherConfig, WorkerConfig, WorkerPool};
//! use txrelay_testkit::InMemoryOutboxStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryOutboxStore::default());
//!     let publisher = Arc::new(BusPublisher::simulated(PublisherConfig::default()));
//!     let pool = WorkerPool::new(WorkerConfig::default(), store, publisher);
//!     pool.start().await;
//!     // ... enqueue records, then:
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery Semantics
//!
//! The relay guarantees at-least-once delivery with idempotent markers: a
//! crash between the bus send and the PUBLISHED mark re-delivers the
//! record on a later tick. Ordering is only per-aggregate, and only
//! because the bus partitions by `aggregate_id`; the pool itself does not
//! serialise across records.
//!
//! # PostgreSQL Schema
//!
//! When using the `postgres` feature, claims rely on `SELECT ... FOR
//! UPDATE SKIP LOCKED` so contending workers skip instead of queueing.
//! See `migrations/001_initial_schema.sql` for the full schema
//! definition.

/// Circuit breaker guarding the publisher.
///
/// The `breaker` module provides the tri-state [`CircuitBreaker`]
/// (CLOSED/HALF_OPEN/OPEN) recorded per publish call.
pub mod breaker;

/// Configuration structures for every relay subsystem.
///
/// The `config` module defines [`RelayConfig`] and its sections, loaded
/// from prefixed environment variables and validated before startup.
pub mod config;

/// Tagged error type shared by every subsystem.
pub mod error;

/// Outbox record types and the record factory.
pub mod record;

/// Publisher, retry policy, and bus transports.
///
/// The `publisher` module provides the [`EventPublisher`] and
/// [`BusTransport`] seams, the [`BusPublisher`] implementation, and the
/// [`SimulatedBus`] used when no broker is configured.
pub mod publisher;

/// Worker pool orchestration.
///
/// The `pool` module provides the [`WorkerPool`] (one poller plus N
/// workers over a bounded channel) and the [`ShutdownToken`] used for
/// graceful shutdown and cancellation.
pub mod pool;

/// Durable outbox access.
///
/// The `store` module defines the [`OutboxStore`] and [`OutboxClaim`]
/// traits; the PostgreSQL implementation lives behind the `postgres`
/// feature.
pub mod store;

#[cfg(feature = "kafka")]
/// Kafka bus transport via rdkafka.
pub mod kafka;

#[cfg(feature = "postgres")]
/// Transactional write path combining a business mutation with the
/// outbox insert.
pub mod enqueue;

#[cfg(feature = "postgres")]
/// Startup wiring and graceful shutdown for the relay process.
pub mod lifecycle;

#[cfg(feature = "metrics")]
/// Prometheus metrics instrumentation.
///
/// The `metrics` module provides the relay's counters, histograms, and
/// gauges plus the axum scrape endpoint, enabled by the `metrics`
/// feature.
pub mod metrics;

/// Tracing and telemetry instrumentation.
///
/// The `telemetry` module provides span helpers and metric recorders that
/// degrade to tracing-only when the `metrics` feature is disabled.
pub mod telemetry;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{
    BreakerConfig, DatabaseConfig, MetricsConfig, PublisherConfig, RelayConfig, WorkerConfig,
};
pub use error::RelayError;
pub use pool::{ShutdownToken, WorkerPool};
pub use publisher::{
    encode_payload, BusMessage, BusPublisher, BusTransport, EventPublisher, SimulatedBus,
};
pub use record::{EventSpec, OutboxRecord, OutboxStatus, RecordId};
pub use store::{OutboxClaim, OutboxStore};

#[cfg(feature = "postgres")]
pub use enqueue::EnqueueService;
#[cfg(feature = "postgres")]
pub use lifecycle::Relay;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresOutboxStore;
