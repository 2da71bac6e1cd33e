//! Process-wide request spacing for the arXiv API.
//!
//! arXiv asks clients to leave a few seconds between requests. Every client in
//! the process draws from one [`RequestGate`], so the budget is shared across
//! concurrent research instances instead of being per query.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Hands out request slots at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestGate {
    min_interval: Duration,
    /// The most recently reserved slot. May lie in the future.
    last_request: Mutex<Option<Instant>>,
}

static SHARED_GATE: OnceLock<Arc<RequestGate>> = OnceLock::new();

impl RequestGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// The gate shared by every client in this process.
    ///
    /// The first caller fixes the interval; later calls get the same gate.
    pub fn shared(min_interval: Duration) -> Arc<Self> {
        SHARED_GATE
            .get_or_init(|| Arc::new(Self::new(min_interval)))
            .clone()
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for the next free slot.
    pub async fn acquire(&self) {
        self.acquire_after(Duration::ZERO).await;
    }

    /// Wait at least `delay`, and for the next free slot.
    ///
    /// A retry passes its backoff here, so the backoff and the spacing overlap
    /// rather than add up.
    pub async fn acquire_after(&self, delay: Duration) {
        let slot = {
            let mut last = self
                .last_request
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let earliest = Instant::now() + delay;
            let slot = match *last {
                Some(previous) => earliest.max(previous + self.min_interval),
                None => earliest,
            };
            *last = Some(slot);
            slot
        }; // guard dropped before the await

        let now = Instant::now();
        if slot > now {
            tracing::debug!(
                wait_ms = (slot - now).as_millis() as u64,
                "Waiting for arXiv request slot"
            );
            tokio::time::sleep_until(slot).await;
        }
    }
}
