//! Admission control for training passes
//!
//! A pass must hold a rate-limiter token, an admission slot and a memory
//! reservation, taken in that order. Slots and reservations are RAII permits
//! released on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use ethos_core::{EthosError, Result};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket limiter
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate_per_sec` tokens per second with a bucket of `burst`; a rate of
    /// zero or less disables limiting
    #[must_use]
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: if rate_per_sec.is_finite() { rate_per_sec.max(0.0) } else { 0.0 },
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Limiter that always admits
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    /// Whether limiting is active
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.rate > 0.0
    }

    /// Take a token, or report how long until one is available
    fn take(&self) -> std::result::Result<(), Duration> {
        if !self.is_limited() {
            return Ok(());
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled_at = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        while let Err(wait) = self.take() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Bounded admission for concurrent training passes
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    semaphore: Arc<Semaphore>,
    limit: usize,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Held while a pass runs
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGuard {
    /// Admit at most `limit` passes at once
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn admitted(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        AdmissionPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| EthosError::Other(e.into()))?;
        Ok(self.admitted(permit))
    }

    /// Take a slot only if one is free now
    #[must_use]
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admitted(permit))
    }

    /// No pass is admitted or running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.semaphore.available_permits() == self.limit
    }

    /// Passes currently holding a slot
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous passes observed
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Configured slot count
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Byte budget shared by concurrent passes; a limit of zero is unbounded
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    limit: usize,
    reserved: Arc<AtomicUsize>,
}

/// Held reservation, returned to the budget on drop
#[derive(Debug)]
pub struct BudgetPermit {
    bytes: usize,
    reserved: Arc<AtomicUsize>,
}

impl BudgetPermit {
    /// Reserved bytes
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.reserved.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

impl MemoryBudget {
    /// Budget of `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            reserved: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve `bytes`, or `None` when that would exceed the limit
    #[must_use]
    pub fn try_reserve(&self, bytes: usize) -> Option<BudgetPermit> {
        let limit = if self.limit == 0 { usize::MAX } else { self.limit };
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(bytes).filter(|total| *total <= limit)
            })
            .ok()?;
        Some(BudgetPermit {
            bytes,
            reserved: Arc::clone(&self.reserved),
        })
    }

    /// Bytes currently reserved
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Configured limit
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}
