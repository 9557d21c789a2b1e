//! Bounded admission for extraction runs.
//!
//! Every extraction holds an [`AdmissionPermit`] for its whole lifetime. Once
//! `limit` permits are out, further callers wait in arrival order until one
//! is dropped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    /// `limit` is clamped to at least one slot.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Waits for a free slot. The semaphore is owned here and never closed,
    /// so acquisition only ever blocks.
    pub async fn acquire(&self) -> AdmissionPermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("admission semaphore is never closed"));
        AdmissionPermit { _permit: permit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}
