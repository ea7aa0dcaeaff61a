use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Download budget: simultaneous requests and, optionally, requests per minute.
#[derive(Clone, Copy, Debug, Default)]
pub struct Limits {
    pub requests_per_min: Option<u64>,
    pub concurrency: Option<u32>,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    per_second: f64,
    available: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn per_minute(rpm: u64) -> Self {
        let capacity = rpm as f64;
        Self { capacity, per_second: capacity / 60.0, available: capacity, refilled_at: Instant::now() }
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.per_second).min(self.capacity);
        self.refilled_at = now;
        if self.available >= 1.0 {
            self.available -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(((1.0 - self.available) / self.per_second).max(0.001)))
        }
    }
}

/// Caps simultaneous requests and, optionally, the request rate.
/// Clones share one budget.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    slots: Option<Arc<Semaphore>>,
    bucket: Option<Arc<Mutex<TokenBucket>>>,
}

/// Held for the duration of one request; dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        Self {
            slots: limits.concurrency.map(|c| Arc::new(Semaphore::new(c.max(1) as usize))),
            bucket: limits
                .requests_per_min
                .filter(|rpm| *rpm > 0)
                .map(|rpm| Arc::new(Mutex::new(TokenBucket::per_minute(rpm)))),
        }
    }

    /// Wait for a concurrency slot, then for a request token.
    pub async fn acquire(&self) -> Permit {
        // The semaphore is never closed
        let slot = match &self.slots {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };

        if let Some(bucket) = &self.bucket {
            loop {
                let wait = match bucket.lock().await.try_take(Instant::now()) {
                    Ok(()) => break,
                    Err(wait) => wait,
                };
                tokio::time::sleep(wait).await;
            }
        }
        Permit { _slot: slot }
    }

    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }
}
