use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use txrelay::error::RelayError;
use txrelay::record::{EventSpec, OutboxRecord, OutboxStatus, RecordId};
use txrelay::store::{OutboxClaim, OutboxStore};

type RecordMap = Arc<Mutex<HashMap<RecordId, OutboxRecord>>>;

/// Business state for the in-memory transactional enqueue: an opaque
/// key/value document store standing in for the domain tables.
pub type BusinessState = HashMap<String, Value>;

/// In-memory outbox store for tests.
///
/// Claims take a per-record async lock with `try_lock`, so contending
/// claimers observe `NotClaimable` exactly like `FOR UPDATE SKIP LOCKED`
/// losers. Dropping a claim without consuming it releases the lock
/// without mutating the record, mirroring a rolled-back claim
/// transaction.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    records: RecordMap,
    locks: Arc<Mutex<HashMap<RecordId, Arc<tokio::sync::Mutex<()>>>>>,
    business: Arc<Mutex<BusinessState>>,
    fail_inserts: Arc<AtomicBool>,
    max_retries: u32,
}

impl InMemoryOutboxStore {
    pub fn new(max_retries: u32) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            business: Arc::new(Mutex::new(HashMap::new())),
            fail_inserts: Arc::new(AtomicBool::new(false)),
            max_retries,
        }
    }

    /// Insert a validated record.
    pub fn insert(&self, record: OutboxRecord) -> Result<RecordId, RelayError> {
        record.validate()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(RelayError::permanent(
                "duplicate key value violates unique constraint \"outbox_pkey\"",
            ));
        }

        let id = record.id;
        let mut records = self.records.lock();
        if records.contains_key(&id) {
            return Err(RelayError::permanent(format!(
                "duplicate outbox record id: {id}"
            )));
        }
        records.insert(id, record);
        Ok(id)
    }

    /// Build a record from a spec and insert it.
    pub fn insert_spec(&self, spec: EventSpec) -> Result<RecordId, RelayError> {
        self.insert(OutboxRecord::from_spec(spec)?)
    }

    /// The in-memory rendering of the transactional write path: run the
    /// mutation against a staged copy of the business state, build the
    /// outbox record from the result, then commit both together. Any
    /// error leaves both untouched.
    pub fn enqueue<R>(
        &self,
        mutation: impl FnOnce(&mut BusinessState) -> Result<R, RelayError>,
        spec: impl FnOnce(&R) -> EventSpec,
    ) -> Result<(R, RecordId), RelayError> {
        let mut staged = self.business.lock().clone();
        let result = mutation(&mut staged)?;
        let record = OutboxRecord::from_spec(spec(&result))?;
        record.validate()?;

        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(RelayError::permanent(
                "duplicate key value violates unique constraint \"outbox_pkey\"",
            ));
        }

        let id = record.id;
        {
            let mut records = self.records.lock();
            if records.contains_key(&id) {
                return Err(RelayError::permanent(format!(
                    "duplicate outbox record id: {id}"
                )));
            }
            *self.business.lock() = staged;
            records.insert(id, record);
        }
        Ok((result, id))
    }

    /// Make every subsequent insert fail like a constraint violation.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, id: RecordId) -> Option<OutboxRecord> {
        self.records.lock().get(&id).cloned()
    }

    /// Every event recorded for one aggregate, oldest first.
    pub fn events_for_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Vec<OutboxRecord> {
        let mut events: Vec<OutboxRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.aggregate_id == aggregate_id && r.aggregate_type == aggregate_type)
            .cloned()
            .collect();
        events.sort_by_key(|r| (r.created_at, r.id.0));
        events
    }

    /// FAILED records, oldest first, regardless of retry budget.
    pub fn failed(&self, limit: usize) -> Vec<OutboxRecord> {
        let mut failed: Vec<OutboxRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.status == OutboxStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|r| (r.created_at, r.id.0));
        failed.truncate(limit);
        failed
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn business_state(&self) -> BusinessState {
        self.business.lock().clone()
    }

    fn lock_for(&self, id: RecordId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, RelayError> {
        let mut deliverable: Vec<OutboxRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| {
                r.status == OutboxStatus::Pending || r.is_retryable(self.max_retries)
            })
            .cloned()
            .collect();
        deliverable.sort_by_key(|r| (r.created_at, r.id.0));
        deliverable.truncate(limit);
        Ok(deliverable)
    }

    async fn claim(&self, id: RecordId) -> Result<Box<dyn OutboxClaim>, RelayError> {
        if !self.records.lock().contains_key(&id) {
            return Err(RelayError::NotClaimable);
        }

        let guard = self
            .lock_for(id)
            .try_lock_owned()
            .map_err(|_| RelayError::NotClaimable)?;

        // Re-read under the lock
        let record = self
            .records
            .lock()
            .get(&id)
            .cloned()
            .ok_or(RelayError::NotClaimable)?;

        Ok(Box::new(InMemoryClaim {
            record,
            records: Arc::clone(&self.records),
            _guard: guard,
        }))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64, RelayError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| RelayError::validation(format!("invalid retention window: {err}")))?;

        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| {
            !(r.status == OutboxStatus::Published
                && r.published_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok((before - records.len()) as u64)
    }
}

struct InMemoryClaim {
    record: OutboxRecord,
    records: RecordMap,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl OutboxClaim for InMemoryClaim {
    fn record(&self) -> &OutboxRecord {
        &self.record
    }

    async fn mark_published(self: Box<Self>) -> Result<(), RelayError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&self.record.id) {
            if record.status != OutboxStatus::Published {
                record.status = OutboxStatus::Published;
                record.published_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_failed(self: Box<Self>, error: &str) -> Result<(), RelayError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&self.record.id) {
            record.status = OutboxStatus::Failed;
            record.error_message = error.to_string();
            record.retry_count += 1;
        }
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), RelayError> {
        Ok(())
    }
}
