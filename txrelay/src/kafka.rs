use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use crate::config::PublisherConfig;
use crate::error::RelayError;
use crate::publisher::{BusMessage, BusTransport};

/// Kafka bus transport.
///
/// Messages are Snappy-compressed; acknowledgement level and round-trip
/// timeout come from the publisher configuration. Transport-level retries
/// are disabled here so the publisher's own retry budget is the only one
/// in play.
pub struct KafkaTransport {
    producer: FutureProducer,
    timeout: std::time::Duration,
}

impl KafkaTransport {
    pub fn new(config: &PublisherConfig) -> Result<Self, RelayError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", "snappy")
            .set("acks", config.required_acks.to_string())
            .set("message.timeout.ms", config.timeout_ms.to_string())
            .set("retries", "0")
            .create()
            .map_err(|err| {
                RelayError::transient(format!("failed to create kafka producer: {err}"))
            })?;

        info!(brokers = %config.brokers.join(","), "kafka producer created");
        Ok(Self {
            producer,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl BusTransport for KafkaTransport {
    async fn send(&self, message: &BusMessage) -> Result<(), RelayError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %message.topic,
                    partition,
                    offset,
                    "event delivered to kafka"
                );
                Ok(())
            }
            Err((err, _)) => Err(RelayError::transient(format!("kafka send failed: {err}"))),
        }
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.producer
            .flush(Timeout::After(self.timeout))
            .map_err(|err| RelayError::transient(format!("kafka flush failed: {err}")))?;
        info!("kafka producer closed");
        Ok(())
    }
}
