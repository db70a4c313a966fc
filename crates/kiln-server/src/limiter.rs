//! Admission control for concurrent connections.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded count of live sessions.
///
/// Admission is decided with a non-blocking acquire in the accept loop; a
/// session holds its [`ConnectionPermit`] for its whole lifetime, so the
/// slot comes back on every exit path.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConnectionLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Claim a slot, or `None` when `limit` sessions are already live.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionPermit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of sessions currently holding a permit.
    pub fn active(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}

/// A claimed connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
