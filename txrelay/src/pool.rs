use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::WorkerConfig;
use crate::error::RelayError;
use crate::publisher::EventPublisher;
use crate::record::{OutboxRecord, OutboxStatus};
use crate::store::OutboxStore;
use crate::telemetry;

/// How long [`WorkerPool::shutdown`] waits for the poller and workers to
/// drain before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Cancellation signal shared by the poller, the workers, and in-flight
/// publish calls.
///
/// A thin wrapper around a `watch` channel holding a single flag:
/// [`cancel`](Self::cancel) flips it once, and every clone observes the
/// flip either by polling [`is_cancelled`](Self::is_cancelled) or by
/// awaiting [`cancelled`](Self::cancelled).
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    flag: Arc<watch::Sender<bool>>,
    watcher: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (flag, watcher) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
            watcher,
        }
    }

    /// Request cancellation. Idempotent; safe to call from any clone.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.watcher.borrow()
    }

    /// Resolve once [`cancel`](Self::cancel) has been called, immediately
    /// so if it already has.
    pub async fn cancelled(&self) {
        let mut watcher = self.watcher.clone();
        // wait_for inspects the current value before suspending
        let _ = watcher.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The relay orchestrator: one polling task feeding `pool_size` worker
/// tasks over a bounded channel of capacity `2 * pool_size`.
///
/// The poller never blocks on a full channel; a record that does not fit
/// stays PENDING in the store and reappears on the next tick. Workers
/// claim each record under a row-level lock, so records handed out twice
/// across ticks are processed exactly once.
pub struct WorkerPool<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: WorkerConfig,
    shutdown: ShutdownToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<S, P> WorkerPool<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    pub fn new(config: WorkerConfig, store: Arc<S>, publisher: Arc<P>) -> Self {
        Self {
            store,
            publisher,
            config,
            shutdown: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token observed by the poller, the workers, and in-flight publish
    /// calls.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Spawn the polling task and the worker tasks.
    pub async fn start(&self) {
        info!(
            pool_size = self.config.pool_size,
            batch_size = self.config.batch_size,
            interval_ms = self.config.interval_ms,
            max_retries = self.config.max_retries,
            "starting worker pool"
        );
        telemetry::set_worker_pool_size(self.config.pool_size);

        let capacity = (self.config.pool_size * 2).max(1);
        let (work_tx, work_rx) = mpsc::channel::<OutboxRecord>(capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut handles = self.handles.lock().await;

        // The poller owns the sender; when it exits on shutdown the
        // channel closes and the workers drain out.
        let poller = {
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::polling_loop(store, work_tx, config, shutdown).await;
            })
        };
        handles.push(poller);

        for worker_id in 0..self.config.pool_size {
            let store = Arc::clone(&self.store);
            let publisher = Arc::clone(&self.publisher);
            let rx = Arc::clone(&work_rx);
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();
            let handle = tokio::spawn(async move {
                Self::worker_loop(worker_id, store, publisher, rx, config, shutdown).await;
            });
            handles.push(handle);
        }
    }

    /// Gracefully stop: cancel, drain every task within one grace
    /// period, close the publisher.
    pub async fn shutdown(&self) {
        info!("draining worker pool");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        // One deadline for the whole pool rather than per task; a stuck
        // task is abandoned, not waited out N times over.
        let drained =
            tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        warn!("relay task failed while draining: {err}");
                    }
                }
            }
            Err(_) => {
                warn!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "pool did not drain within the grace period, aborting remaining tasks"
                );
                for aborter in aborters {
                    aborter.abort();
                }
            }
        }

        if let Err(err) = self.publisher.close().await {
            warn!("failed to close publisher: {err}");
        }
        info!("worker pool stopped");
    }

    async fn polling_loop(
        store: Arc<S>,
        work_tx: mpsc::Sender<OutboxRecord>,
        config: WorkerConfig,
        shutdown: ShutdownToken,
    ) {
        let mut ticker = tokio::time::interval(config.interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("polling task shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let records = match store.pending(config.batch_size).await {
                Ok(records) => records,
                Err(err) => {
                    warn!("failed to fetch pending records: {err}");
                    telemetry::record_event_failed("database_error", "unknown");
                    continue;
                }
            };

            telemetry::set_events_in_queue("pending", records.len());
            if records.is_empty() {
                continue;
            }
            debug!(count = records.len(), "dispatching pending records");

            for record in records {
                let id = record.id;
                match work_tx.try_send(record) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // The record stays PENDING and reappears next tick.
                        warn!(record_id = %id, "work queue full, record deferred to next tick");
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    async fn worker_loop(
        worker_id: usize,
        store: Arc<S>,
        publisher: Arc<P>,
        work_rx: Arc<Mutex<mpsc::Receiver<OutboxRecord>>>,
        config: WorkerConfig,
        shutdown: ShutdownToken,
    ) {
        debug!(worker_id, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let received = {
                let mut rx = work_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    record = rx.recv() => record,
                }
            };

            let Some(record) = received else {
                // Shutdown signalled or the channel closed behind the poller.
                break;
            };

            telemetry::inc_active_workers();
            Self::process_record(&store, &publisher, &config, &shutdown, record).await;
            telemetry::dec_active_workers();
        }

        debug!(worker_id, "worker stopped");
    }

    /// Claim and process a single record.
    ///
    /// Holds the claim for exactly the publish-and-mark work; every exit
    /// path either consumes the claim (commit) or drops it (rollback).
    async fn process_record(
        store: &Arc<S>,
        publisher: &Arc<P>,
        config: &WorkerConfig,
        shutdown: &ShutdownToken,
        record: OutboxRecord,
    ) {
        let started = Instant::now();
        let id = record.id;
        let event_type = record.event_type.clone();

        let claim = match store.claim(id).await {
            Ok(claim) => claim,
            Err(RelayError::NotClaimable) => {
                // Another worker holds it, or it has already moved on.
                trace!(record_id = %id, "record not claimable, skipping");
                return;
            }
            Err(err) => {
                warn!(record_id = %id, "failed to claim record: {err}");
                telemetry::record_event_failed("lock_error", &event_type);
                return;
            }
        };

        // Re-read under the lock; the polled snapshot may be stale.
        let current = claim.record().clone();
        match current.status {
            OutboxStatus::Published => {
                debug!(record_id = %id, "record already published, skipping");
                telemetry::record_event_processed("already_published", &event_type);
                if let Err(err) = claim.release().await {
                    warn!(record_id = %id, "failed to release claim: {err}");
                }
            }
            OutboxStatus::Failed if current.retry_count >= config.max_retries => {
                debug!(
                    record_id = %id,
                    retry_count = current.retry_count,
                    "record exhausted its retry budget, skipping"
                );
                telemetry::record_event_processed("permanently_failed", &event_type);
                if let Err(err) = claim.release().await {
                    warn!(record_id = %id, "failed to release claim: {err}");
                }
            }
            _ => {
                let outcome = match tokio::time::timeout(
                    config.process_timeout(),
                    publisher.publish(shutdown, &current),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::Timeout(config.process_timeout())),
                };

                match outcome {
                    Ok(()) => match claim.mark_published().await {
                        Ok(()) => {
                            telemetry::record_event_processed("published", &event_type);
                        }
                        Err(err) => {
                            warn!(record_id = %id, "failed to mark record published: {err}");
                            telemetry::record_event_failed("update_error", &event_type);
                        }
                    },
                    Err(RelayError::Cancelled) => {
                        // Rolls back the claim; the record stays PENDING.
                        debug!(record_id = %id, "publish cancelled, releasing claim");
                        drop(claim);
                    }
                    Err(err) => {
                        telemetry::record_event_failed(err.error_type(), &event_type);

                        let attempts = current.retry_count + 1;
                        telemetry::record_event_retried(attempts, &event_type);

                        let message = if attempts >= config.max_retries {
                            format!("giving up after {attempts} attempts: {err}")
                        } else {
                            format!(
                                "publish failed (attempt {attempts}/{}): {err}",
                                config.max_retries
                            )
                        };

                        match claim.mark_failed(&message).await {
                            Ok(()) if attempts >= config.max_retries => {
                                warn!(record_id = %id, attempts, "record permanently failed");
                            }
                            Ok(()) => {
                                debug!(record_id = %id, attempts, "record will be retried");
                            }
                            Err(mark_err) => {
                                warn!(record_id = %id, "failed to mark record failed: {mark_err}");
                                telemetry::record_event_failed("update_error", &event_type);
                            }
                        }
                    }
                }

                telemetry::observe_processing_duration(&event_type, started.elapsed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn fresh_token_reports_not_cancelled() {
        assert!(!ShutdownToken::default().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_from_any_clone_is_visible_everywhere() {
        let token = ShutdownToken::new();
        let observer = token.clone();

        // Cancelling through a clone flips the shared flag
        token.clone().cancel();

        assert!(token.is_cancelled());
        assert!(observer.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_once_cancelled() {
        let token = ShutdownToken::new();
        token.cancel();
        token.cancel(); // idempotent

        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() must not block after cancel()");
    }

    #[tokio::test]
    async fn waiter_blocked_in_cancelled_wakes_on_cancel() {
        let token = ShutdownToken::new();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                token.is_cancelled()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let observed = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake on cancel")
            .expect("waiter task panicked");
        assert!(observed);
    }
}
