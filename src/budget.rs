use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Process-wide cap on concurrently open target connections.
///
/// Every live session connection holds one slot. The router raises the cap
/// to the number of known sessions before a new session starts, so a session
/// never waits for a slot.
#[derive(Debug)]
pub struct ConnectionBudget {
    limit: AtomicUsize,
    slots: Arc<Semaphore>,
}

impl Default for ConnectionBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBudget {
    pub fn new() -> Self {
        Self {
            limit: AtomicUsize::new(0),
            slots: Arc::new(Semaphore::new(0)),
        }
    }

    /// Raises the limit to at least `wanted` and returns the resulting limit.
    /// Never lowers it.
    pub fn ensure_capacity(&self, wanted: usize) -> usize {
        let previous = self.limit.fetch_max(wanted, Ordering::AcqRel);
        if wanted > previous {
            self.slots.add_permits(wanted - previous);
            tracing::debug!(previous, limit = wanted, "raised connection limit");
            return wanted;
        }
        previous
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.slots).acquire_owned().await
    }
}
