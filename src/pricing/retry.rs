//! Bounded retry with exponential backoff, and a per-target circuit breaker.
//!
//! Backoff is `base * 2^attempt` capped at a max delay, with +/-20% jitter.
//! The breaker is closed / open / half-open: it opens after a run of
//! consecutive failures, fails fast while open, and lets a single probe
//! through after the cooldown. State is per logical target, typically one
//! breaker per provider.

use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for `attempt` (0-based), jittered +/-20%.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        exp.mul_f64(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    target: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: parking_lot::Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_settings(target, 5, Duration::from_secs(60))
    }

    pub fn with_settings(
        target: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: parking_lot::Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Admission check before a call. While open, fails fast; after the
    /// cooldown, exactly one probe is admitted.
    pub fn check(&self) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!(target = %self.target, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(PipelineError::TransientNetwork(format!(
                        "circuit open for {}",
                        self.target
                    )))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(PipelineError::TransientNetwork(format!(
                        "circuit probing {}",
                        self.target
                    )))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            debug!(target = %self.target, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(target = %self.target, "circuit breaker re-opened after failed probe");
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        target = %self.target,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().state == BreakerState::Open
    }
}

/// Run `op` under the retry policy and breaker. Only transient network
/// errors are retried; `ProviderEmpty` fails over immediately without
/// touching breaker health, and `Cancelled` is passed straight through.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let mut last_err = PipelineError::TransientNetwork("no attempts made".to_string());
    for attempt in 0..policy.max_attempts.max(1) {
        breaker.check()?;
        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(PipelineError::ProviderEmpty) => return Err(PipelineError::ProviderEmpty),
            Err(err) => {
                let retryable = err.is_retryable();
                breaker.record_failure();
                last_err = err;
                if retryable && attempt + 1 < policy.max_attempts {
                    let delay = policy.backoff_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    sleep(delay).await;
                } else {
                    return Err(last_err);
                }
            }
        }
    }
    Err(last_err)
}
