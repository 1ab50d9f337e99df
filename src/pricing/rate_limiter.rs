//! Per-provider token-bucket admission.
//!
//! `acquire` suspends the caller until a token is available and is FIFO-fair
//! under contention: waiters queue on a tokio mutex and the current head
//! sleeps while holding it, so nobody overtakes. Tokens regenerate at 90% of
//! the provider's advertised per-minute ceiling; the 10% buffer is a
//! hard-coded safety margin. The only way out mid-wait is shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::shutdown::ShutdownToken;

/// Fraction of the advertised ceiling we actually spend.
const SAFETY_MARGIN: f64 = 0.9;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    shutdown: ShutdownToken,
}

impl TokenBucket {
    /// Bucket sized from a provider's advertised requests-per-minute
    /// ceiling. `capacity` is the burst allowance.
    pub fn per_minute(ceiling_per_minute: u32, capacity: u32, shutdown: ShutdownToken) -> Self {
        let refill_per_sec = f64::from(ceiling_per_minute) * SAFETY_MARGIN / 60.0;
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            shutdown,
        }
    }

    /// Take one token, suspending until one regenerates. FIFO under
    /// contention. Returns `Cancelled` only on shutdown.
    pub async fn acquire(&self) -> PipelineResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Waiters queue here in arrival order; the head holds the lock
        // through its sleep, which is what makes admission FIFO.
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
            debug!(wait_ms = wait.as_millis() as u64, "rate limit: waiting for token");
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.shutdown.cancelled() => return Err(PipelineError::Cancelled),
            }
            self.refill(&mut state);
        }

        state.tokens = (state.tokens - 1.0).max(0.0);
        Ok(())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

/// One bucket per provider tag, created up front at construction time.
pub struct RateLimiterRegistry {
    buckets: HashMap<String, Arc<TokenBucket>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        provider: &str,
        ceiling_per_minute: u32,
        capacity: u32,
        shutdown: ShutdownToken,
    ) {
        self.buckets.insert(
            provider.to_string(),
            Arc::new(TokenBucket::per_minute(ceiling_per_minute, capacity, shutdown)),
        );
    }

    /// Suspend until the provider's bucket yields a token. Unknown providers
    /// pass through unthrottled.
    pub async fn acquire(&self, provider: &str) -> PipelineResult<()> {
        match self.buckets.get(provider) {
            Some(bucket) => bucket.acquire().await,
            None => Ok(()),
        }
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_pair;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_then_waits() {
        let bucket = TokenBucket::per_minute(60, 2, ShutdownToken::detached());

        let start = Instant::now();
        bucket.acquire().await.unwrap();
        bucket.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third token must wait for refill at 60/min * 0.9 = 0.9 tok/sec.
        bucket.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1000), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(1300), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_is_fifo_under_contention() {
        let bucket = Arc::new(TokenBucket::per_minute(60, 1, ShutdownToken::detached()));
        bucket.acquire().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let bucket = bucket.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire().await.unwrap();
                order.lock().push(i);
            }));
            // Yield so each waiter enqueues before the next spawns.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_unblocks_waiter_with_cancelled() {
        let (handle, token) = shutdown_pair();
        let bucket = Arc::new(TokenBucket::per_minute(1, 1, token));
        bucket.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let bucket = bucket.clone();
            async move { bucket.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.trigger();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_stays_under_ninety_percent_of_ceiling() {
        // 600/min ceiling -> 9 tokens/sec effective.
        let bucket = TokenBucket::per_minute(600, 1, ShutdownToken::detached());
        let start = Instant::now();
        let mut granted = 0u32;
        while start.elapsed() < Duration::from_secs(10) {
            bucket.acquire().await.unwrap();
            granted += 1;
        }
        let window_secs = start.elapsed().as_secs_f64();
        let allowed = (0.9 * 600.0 * window_secs / 60.0).ceil() as u32 + 1;
        assert!(granted <= allowed, "granted {} allowed {}", granted, allowed);
    }
}
