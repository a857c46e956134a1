//! Byte-rate governors for streamed reads and writes

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::pin::pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Grants byte allowances to streaming reads and writes.
///
/// Implementations may suspend the caller until bytes become available.
#[async_trait]
pub trait Governor: Send + Sync {
    /// Request up to `requested` bytes; returns the granted amount (at
    /// least 1 unless the call fails).
    async fn grant(&self, requested: usize, cancel: &CancellationToken) -> Result<usize>;
}

/// Governor that never limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl Governor for Unlimited {
    async fn grant(&self, requested: usize, _cancel: &CancellationToken) -> Result<usize> {
        Ok(requested)
    }
}

struct BucketState {
    /// Bytes added per interval. Reconfigurable; applied on the next tick.
    count: usize,
    available: usize,
}

struct BucketInner {
    state: Mutex<BucketState>,
    replenished: Notify,
    interval: Duration,
}

/// Interval-drip token bucket: every `interval`, `count` bytes become
/// available; empty-handed waiters dequeue on the next replenishment.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<BucketInner>,
}

impl TokenBucket {
    pub fn new(count: usize, interval: Duration) -> Self {
        let inner = Arc::new(BucketInner {
            state: Mutex::new(BucketState {
                count,
                available: count,
            }),
            replenished: Notify::new(),
            interval,
        });

        let weak: Weak<BucketInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let mut state = inner.state.lock().expect("bucket poisoned");
                state.available = state.count;
                drop(state);
                inner.replenished.notify_waiters();
            }
        });

        Self { inner }
    }

    /// Bytes currently available without waiting.
    pub fn available(&self) -> usize {
        self.inner.state.lock().expect("bucket poisoned").available
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Change the per-interval byte count. Takes effect on the next tick.
    pub fn set_count(&self, count: usize) {
        self.inner.state.lock().expect("bucket poisoned").count = count;
    }

    fn try_take(&self, requested: usize) -> Option<usize> {
        let mut state = self.inner.state.lock().expect("bucket poisoned");
        if state.available == 0 {
            return None;
        }
        let granted = requested.min(state.available);
        state.available -= granted;
        Some(granted)
    }
}

#[async_trait]
impl Governor for TokenBucket {
    async fn grant(&self, requested: usize, cancel: &CancellationToken) -> Result<usize> {
        if requested == 0 {
            return Ok(0);
        }
        loop {
            if let Some(granted) = self.try_take(requested) {
                return Ok(granted);
            }
            let mut notified = pin!(self.inner.replenished.notified());
            // register before re-checking so a concurrent tick is not lost
            notified.as_mut().enable();
            if let Some(granted) = self.try_take(requested) {
                return Ok(granted);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_grants_are_capped_by_available() {
        let bucket = TokenBucket::new(1000, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        assert_eq!(bucket.grant(400, &cancel).await.unwrap(), 400);
        assert_eq!(bucket.grant(900, &cancel).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn test_empty_bucket_waits_for_replenishment() {
        let bucket = TokenBucket::new(100, Duration::from_millis(50));
        let cancel = CancellationToken::new();
        assert_eq!(bucket.grant(100, &cancel).await.unwrap(), 100);

        let started = Instant::now();
        assert_eq!(bucket.grant(10, &cancel).await.unwrap(), 10);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let bucket = TokenBucket::new(10, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        assert_eq!(bucket.grant(10, &cancel).await.unwrap(), 10);

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        assert!(matches!(
            bucket.grant(1, &cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_reconfiguration_applies_on_next_tick() {
        let bucket = TokenBucket::new(10, Duration::from_millis(40));
        let cancel = CancellationToken::new();
        assert_eq!(bucket.grant(10, &cancel).await.unwrap(), 10);

        bucket.set_count(500);
        // nothing new until the tick fires
        assert_eq!(bucket.available(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(bucket.available(), 500);
    }
}
