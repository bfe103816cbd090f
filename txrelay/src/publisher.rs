use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::SecondsFormat;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::config::PublisherConfig;
use crate::error::RelayError;
use crate::pool::ShutdownToken;
use crate::record::OutboxRecord;
use crate::telemetry;

/// Delivers outbox records to the external bus.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// Publish one record. Implementations own their retry budget; the
    /// call returns once the record is delivered, the budget is
    /// exhausted, or `cancel` fires.
    async fn publish(&self, cancel: &ShutdownToken, record: &OutboxRecord)
        -> Result<(), RelayError>;

    /// Flush and close the underlying transport.
    async fn close(&self) -> Result<(), RelayError>;
}

/// One raw message on the wire: the seam between the retry/breaker logic
/// and the transport.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    async fn send(&self, message: &BusMessage) -> Result<(), RelayError>;

    async fn close(&self) -> Result<(), RelayError>;

    /// True for transports that accept messages without a real bus.
    fn is_simulated(&self) -> bool {
        false
    }
}

/// A fully-encoded bus message.
///
/// The key is the aggregate id, which gives per-aggregate ordering at the
/// bus layer for single-partition routing.
#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub headers: Vec<(String, String)>,
}

impl BusMessage {
    /// Encode a record into its wire form.
    pub fn from_record(topic: &str, record: &OutboxRecord) -> Result<Self, RelayError> {
        Ok(Self {
            topic: topic.to_string(),
            key: record.aggregate_id.clone(),
            payload: encode_payload(record)?,
            headers: vec![
                ("event_type".to_string(), record.event_type.clone()),
                ("aggregate_type".to_string(), record.aggregate_type.clone()),
                ("event_id".to_string(), record.id.to_string()),
            ],
        })
    }
}

/// Serialise a record to the JSON value carried on the bus.
///
/// `created_at` is RFC-3339 with second precision; `event_metadata` is
/// present only when the record carries metadata.
pub fn encode_payload(record: &OutboxRecord) -> Result<String, RelayError> {
    let mut payload = Map::new();
    payload.insert("event_id".to_string(), Value::String(record.id.to_string()));
    payload.insert(
        "aggregate_id".to_string(),
        Value::String(record.aggregate_id.clone()),
    );
    payload.insert(
        "aggregate_type".to_string(),
        Value::String(record.aggregate_type.clone()),
    );
    payload.insert(
        "event_type".to_string(),
        Value::String(record.event_type.clone()),
    );
    payload.insert("event_data".to_string(), record.payload.clone());
    payload.insert(
        "created_at".to_string(),
        Value::String(
            record
                .created_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    );
    if let Some(metadata) = &record.metadata {
        payload.insert("event_metadata".to_string(), metadata.clone());
    }

    serde_json::to_string(&Value::Object(payload))
        .map_err(|err| RelayError::permanent(format!("failed to encode bus payload: {err}")))
}

/// Transport used when no brokers are configured or the real transport
/// cannot be constructed. Accepts every message, logs it, and sleeps
/// briefly to simulate bus latency, so the relay can run end-to-end in
/// dev and test without a live broker.
#[derive(Debug, Default)]
pub struct SimulatedBus;

#[async_trait]
impl BusTransport for SimulatedBus {
    async fn send(&self, message: &BusMessage) -> Result<(), RelayError> {
        debug!(
            topic = %message.topic,
            key = %message.key,
            "simulating event publication"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// The resilient publisher: serialisation, bounded retry with optional
/// exponential backoff and jitter, and circuit breaker integration,
/// layered over a [`BusTransport`].
pub struct BusPublisher {
    config: PublisherConfig,
    transport: Arc<dyn BusTransport>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl BusPublisher {
    pub fn new(
        config: PublisherConfig,
        transport: Arc<dyn BusTransport>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            config,
            transport,
            breaker,
        }
    }

    /// A publisher running in simulation mode.
    pub fn simulated(config: PublisherConfig) -> Self {
        Self::new(config, Arc::new(SimulatedBus), None)
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn is_simulated(&self) -> bool {
        self.transport.is_simulated()
    }

    /// Delay before the next attempt, `attempt` counting from zero.
    ///
    /// With exponential retry the delay is
    /// `base_delay * multiplier^attempt`, scaled by a jitter factor drawn
    /// uniformly from [0.5, 1.5) and clamped to `max_delay` afterwards.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.config.exponential_retry_enabled {
            return self.config.retry_delay();
        }

        let mut delay =
            self.config.base_delay().as_secs_f64() * self.config.multiplier.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        delay *= jitter;

        let max = self.config.max_delay().as_secs_f64();
        Duration::from_secs_f64(delay.min(max))
    }

    async fn send_with_retries(
        &self,
        cancel: &ShutdownToken,
        record: &OutboxRecord,
    ) -> Result<(), RelayError> {
        let message = BusMessage::from_record(&self.config.topic, record)?;
        let total_attempts = self.config.max_retries + 1;
        let mut last_err = RelayError::transient("no publish attempt was made");

        for attempt in 0..total_attempts {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            match self.transport.send(&message).await {
                Ok(()) => {
                    debug!(
                        record_id = %record.id,
                        topic = %message.topic,
                        attempt = attempt + 1,
                        "event published to bus"
                    );
                    return Ok(());
                }
                Err(err @ RelayError::Permanent(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        record_id = %record.id,
                        attempt = attempt + 1,
                        total_attempts,
                        "failed to publish event: {err}"
                    );
                    last_err = err;
                }
            }

            if attempt + 1 == total_attempts {
                break;
            }

            let delay = self.retry_delay(attempt);
            telemetry::observe_retry_delay(attempt + 1, delay);

            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(RelayError::transient(format!(
            "failed to publish event after {total_attempts} attempts: {last_err}"
        )))
    }
}

#[async_trait]
impl EventPublisher for BusPublisher {
    async fn publish(
        &self,
        cancel: &ShutdownToken,
        record: &OutboxRecord,
    ) -> Result<(), RelayError> {
        if let Some(breaker) = &self.breaker {
            breaker.try_acquire()?;
        }

        let started = Instant::now();
        let result = self.send_with_retries(cancel, record).await;

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(()) => breaker.record_success(),
                // Cancellation says nothing about bus health
                Err(RelayError::Cancelled) => {}
                Err(_) => breaker.record_failure(),
            }
        }

        telemetry::observe_publishing_duration(
            &self.config.topic,
            &record.event_type,
            started.elapsed(),
        );
        if result.is_ok() {
            telemetry::record_event_published(&self.config.topic, &record.event_type);
        }

        result
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventSpec;
    use serde_json::json;

    fn record() -> OutboxRecord {
        OutboxRecord::from_spec(
            EventSpec::new(
                "A1",
                "Order",
                "OrderCreated",
                json!({"order_id": "A1", "total": 100}),
            )
            .with_metadata(json!({"source": "api"})),
        )
        .unwrap()
    }

    fn publisher(config: PublisherConfig) -> BusPublisher {
        BusPublisher::simulated(config)
    }

    #[test]
    fn fixed_delay_when_exponential_retry_is_disabled() {
        let p = publisher(PublisherConfig {
            retry_delay_ms: 250,
            exponential_retry_enabled: false,
            ..Default::default()
        });
        assert_eq!(p.retry_delay(0), Duration::from_millis(250));
        assert_eq!(p.retry_delay(5), Duration::from_millis(250));
    }

    #[test]
    fn exponential_delay_grows_within_jitter_bounds() {
        let p = publisher(PublisherConfig {
            exponential_retry_enabled: true,
            base_delay_ms: 100,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            ..Default::default()
        });

        for attempt in 0..4u32 {
            let expected = 0.1 * 2.0f64.powi(attempt as i32);
            let delay = p.retry_delay(attempt).as_secs_f64();
            assert!(
                delay >= expected * 0.5 && delay < expected * 1.5,
                "attempt {attempt}: delay {delay} outside [{}, {})",
                expected * 0.5,
                expected * 1.5
            );
        }
    }

    #[test]
    fn exponential_delay_is_clamped_after_jitter() {
        let p = publisher(PublisherConfig {
            exponential_retry_enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 2_000,
            multiplier: 10.0,
            ..Default::default()
        });

        for _ in 0..20 {
            assert!(p.retry_delay(5) <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn payload_carries_the_wire_contract() {
        let record = record();
        let payload: Value = serde_json::from_str(&encode_payload(&record).unwrap()).unwrap();

        assert_eq!(payload["event_id"], record.id.to_string());
        assert_eq!(payload["aggregate_id"], "A1");
        assert_eq!(payload["aggregate_type"], "Order");
        assert_eq!(payload["event_type"], "OrderCreated");
        assert_eq!(payload["event_data"], record.payload);
        assert_eq!(payload["event_metadata"], json!({"source": "api"}));

        // RFC-3339, second precision
        let created_at = payload["created_at"].as_str().unwrap();
        assert!(created_at.ends_with('Z'));
        assert!(!created_at.contains('.'));
        chrono::DateTime::parse_from_rfc3339(created_at).unwrap();
    }

    #[test]
    fn metadata_is_omitted_when_absent() {
        let mut record = record();
        record.metadata = None;
        let payload: Value = serde_json::from_str(&encode_payload(&record).unwrap()).unwrap();
        assert!(payload.get("event_metadata").is_none());
    }

    #[test]
    fn message_headers_and_key_follow_the_contract() {
        let record = record();
        let message = BusMessage::from_record("orders.events", &record).unwrap();

        assert_eq!(message.topic, "orders.events");
        assert_eq!(message.key, "A1");
        assert_eq!(
            message.headers,
            vec![
                ("event_type".to_string(), "OrderCreated".to_string()),
                ("aggregate_type".to_string(), "Order".to_string()),
                ("event_id".to_string(), record.id.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn simulated_publish_succeeds() {
        let p = publisher(PublisherConfig::default());
        assert!(p.is_simulated());
        let cancel = ShutdownToken::new();
        p.publish(&cancel, &record()).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_attempt() {
        let p = publisher(PublisherConfig::default());
        let cancel = ShutdownToken::new();
        cancel.cancel();
        let err = p.publish(&cancel, &record()).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }
}
