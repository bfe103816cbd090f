use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// Unique identifier for an outbox record.
///
/// Uses UUID v7 for time-ordered uniqueness and efficient indexing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Create a new record ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of an outbox record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Committed but not yet delivered to the bus.
    Pending,
    /// Delivered; terminal on the success path.
    Published,
    /// Last delivery attempt failed. Re-claimable while the retry budget
    /// lasts.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(RelayError::permanent(format!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

/// Caller-facing description of an event to enqueue.
///
/// An `EventSpec` carries only what the write path knows; the record
/// factory stamps id, timestamps, and initial state.
#[derive(Clone, Debug)]
pub struct EventSpec {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Value,
    pub metadata: Option<Value>,
}

impl EventSpec {
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A durable row representing a not-yet-delivered event.
///
/// Records are created by the enqueue path inside the business
/// transaction and mutated only by workers holding a row-level claim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: RecordId,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: String,
}

impl OutboxRecord {
    /// Build a fully-populated pending record from an [`EventSpec`].
    ///
    /// This is the only constructor; the storage layer rejects records
    /// that did not pass through it.
    pub fn from_spec(spec: EventSpec) -> Result<Self, RelayError> {
        let record = Self {
            id: RecordId::new(),
            aggregate_id: spec.aggregate_id,
            aggregate_type: spec.aggregate_type,
            event_type: spec.event_type,
            payload: spec.payload,
            metadata: spec.metadata,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            error_message: String::new(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the insert-time invariants.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.aggregate_id.is_empty() {
            return Err(RelayError::validation("aggregate_id is required"));
        }
        if self.aggregate_type.is_empty() {
            return Err(RelayError::validation("aggregate_type is required"));
        }
        if self.event_type.is_empty() {
            return Err(RelayError::validation("event_type is required"));
        }
        if self.payload.is_null() {
            return Err(RelayError::validation("payload is required"));
        }
        match self.status {
            OutboxStatus::Published if self.published_at.is_none() => Err(
                RelayError::validation("published record without published_at"),
            ),
            OutboxStatus::Pending | OutboxStatus::Failed if self.published_at.is_some() => Err(
                RelayError::validation("unpublished record with published_at"),
            ),
            _ => Ok(()),
        }
    }

    /// Whether a failed record still has retry budget left.
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        self.status == OutboxStatus::Failed && self.retry_count < max_retries
    }
}
