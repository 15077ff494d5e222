//! Admission control: a bounded semaphore gating every POST endpoint.
//!
//! A request either gets a slot within the configured wait timeout or is
//! rejected with the rate-limit error.  The permit is an RAII guard, so
//! the slot is released on every exit path, early returns and panics
//! included.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ApiError;

/// RAII guard holding one admission slot.
pub struct Permit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Gateway-wide concurrency gate.
pub struct Admission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait up to `wait` for a slot; [`ApiError::RateLimited`] on expiry.
    pub async fn acquire(&self, wait: Duration) -> Result<Permit, ApiError> {
        match tokio::time::timeout(wait, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Permit { permit }),
            // Elapsed, or the semaphore was closed (never happens here).
            _ => Err(ApiError::RateLimited),
        }
    }

    /// Number of requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_release_on_drop() {
        let admission = Admission::new(2);
        let p1 = admission.acquire(Duration::from_millis(50)).await.unwrap();
        let p2 = admission.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(admission.in_flight(), 2);

        assert!(admission.acquire(Duration::from_millis(50)).await.is_err());

        drop(p1);
        let _p3 = admission.acquire(Duration::from_millis(50)).await.unwrap();
        drop(p2);
        assert_eq!(admission.in_flight(), 1);
    }

    #[tokio::test]
    async fn acquire_rejects_within_the_wait_bound() {
        let admission = Admission::new(1);
        let _held = admission.acquire(Duration::from_millis(50)).await.unwrap();

        let start = std::time::Instant::now();
        let denied = admission.acquire(Duration::from_millis(100)).await;
        assert!(matches!(denied, Err(ApiError::RateLimited)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
