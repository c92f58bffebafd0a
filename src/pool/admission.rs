//! Checkout admission shared by every pool implementation
//!
//! A lease holds an [`AdmissionPermit`] for as long as it is checked out, so the
//! number of outstanding leases never exceeds the configured maximum. Shrinking
//! below the number of outstanding leases leaves a debt that released permits
//! pay off instead of returning to the semaphore.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct Shared {
    in_use: AtomicUsize,
    pending_shrink: AtomicUsize,
}

/// Why admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmissionError {
    TimedOut,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Admission {
    permits: Arc<Semaphore>,
    max_size: AtomicUsize,
    waiting: AtomicUsize,
    shared: Arc<Shared>,
}

impl Admission {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_size)),
            max_size: AtomicUsize::new(max_size),
            waiting: AtomicUsize::new(0),
            shared: Arc::new(Shared {
                in_use: AtomicUsize::new(0),
                pending_shrink: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) async fn admit(&self, timeout: Duration) -> Result<AdmissionPermit, AdmissionError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match permit {
            Ok(Ok(permit)) => {
                self.shared.in_use.fetch_add(1, Ordering::SeqCst);
                Ok(AdmissionPermit {
                    permit: Some(permit),
                    shared: self.shared.clone(),
                })
            }
            Ok(Err(_)) => Err(AdmissionError::Closed),
            Err(_) => Err(AdmissionError::TimedOut),
        }
    }

    /// Set the maximum; returns the previous one
    pub(crate) fn resize(&self, max_size: usize) -> usize {
        let current = self.max_size.swap(max_size, Ordering::SeqCst);
        if max_size > current {
            let mut grow = max_size - current;
            // Cancel outstanding shrink debt before adding permits
            while grow > 0 {
                let cancelled = self
                    .shared
                    .pending_shrink
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if !cancelled {
                    break;
                }
                grow -= 1;
            }
            self.permits.add_permits(grow);
        } else if max_size < current {
            let shrink = current - max_size;
            let forgotten = self.permits.forget_permits(shrink);
            self.shared
                .pending_shrink
                .fetch_add(shrink - forgotten, Ordering::SeqCst);
        }
        current
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size.load(Ordering::SeqCst)
    }

    pub(crate) fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::SeqCst)
    }

    pub(crate) fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }
}

/// One admitted checkout; releasing it frees the slot or pays shrink debt
#[derive(Debug)]
pub(crate) struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
        let pay_shrink = self
            .shared
            .pending_shrink
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if let Some(permit) = self.permit.take() {
            if pay_shrink {
                permit.forget();
            }
        }
    }
}
