use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Bounds the number of requests in flight.
///
/// Permits are released when the [`Permit`] is dropped, which covers normal
/// completion, errors and tasks cancelled mid-await alike.
#[derive(Debug)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    gauge: Arc<InFlightGauge>,
}

#[derive(Debug, Default)]
struct InFlightGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Slot held by an in-flight request.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<InFlightGauge>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gauge.exit();
    }
}

impl ConcurrencyController {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            gauge: Arc::new(InFlightGauge::default()),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Permit {
        // The semaphore is private to the controller and never closed
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("concurrency semaphore is never closed");
        self.admit(permit)
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.admit(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.gauge.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held permits observed so far.
    pub fn peak(&self) -> usize {
        self.gauge.peak.load(Ordering::Acquire)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> Permit {
        self.gauge.enter();
        Permit {
            _permit: permit,
            gauge: Arc::clone(&self.gauge),
        }
    }
}
