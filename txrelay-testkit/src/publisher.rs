use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use txrelay::error::RelayError;
use txrelay::publisher::{BusMessage, BusTransport};

/// Scripted bus transport for tests.
///
/// Can be told to fail the first N sends or to fail every send; captures
/// every successfully delivered message for assertions.
pub struct ScriptedTransport {
    remaining_failures: AtomicU32,
    always_fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<BusMessage>>,
    attempts: AtomicU32,
    closed: AtomicBool,
}

impl ScriptedTransport {
    /// A transport where every send succeeds.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Fail the first `n` sends, succeed afterwards.
    pub fn failing_first(n: u32) -> Arc<Self> {
        let transport = Self::new();
        transport.remaining_failures.store(n, Ordering::SeqCst);
        transport
    }

    /// Fail every send.
    pub fn always_failing() -> Arc<Self> {
        let transport = Self::new();
        transport.always_fail.store(true, Ordering::SeqCst);
        transport
    }

    /// Sleep this long inside every send.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Every message delivered so far.
    pub fn sent(&self) -> Vec<BusMessage> {
        self.sent.lock().clone()
    }

    /// Total send attempts, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusTransport for ScriptedTransport {
    async fn send(&self, message: &BusMessage) -> Result<(), RelayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(RelayError::transient("bus unavailable"));
        }

        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RelayError::transient("simulated broker failure"));
        }

        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
