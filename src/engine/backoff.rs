//! Retry policy for throttled upstream calls.
//!
//! Only `TrackerError::RateLimited` is retried. Everything else fails on
//! the first attempt so the caller can fall back immediately. Retries run
//! through `backoff::future::Retry` with the sleeper injected, so tests run
//! without wall-clock delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::future::Retry;
use backoff::ExponentialBackoff;
use tracing::debug;

use crate::types::TrackerError;

// ---------------------------------------------------------------------------
// Sleeper
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Ceiling for a single backoff interval.
const MAX_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one. Zero behaves as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Randomization factor in `[0, 1]`: each delay lands within
    /// `delay * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay schedule `base * 2^retry`, cut off once the attempt budget
    /// is spent.
    pub fn schedule(&self) -> AttemptBounded<ExponentialBackoff> {
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut inner: ExponentialBackoff = ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: jitter,
            multiplier: 2.0,
            max_interval: MAX_INTERVAL.max(self.base_delay),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        inner.reset();
        AttemptBounded {
            inner,
            retries_left: self.max_attempts.max(1) - 1,
        }
    }

    /// Run `op` until it succeeds, fails with a non-throttling error, or
    /// the attempt budget is spent. Exhaustion returns the last error.
    pub async fn retry<T, F, Fut>(&self, sleeper: Arc<dyn Sleeper>, label: &str, mut op: F) -> Result<T, TrackerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        let mut attempt = 0u32;
        let notify = |e: TrackerError, delay: Duration| {
            attempt += 1;
            debug!(
                call = label,
                attempt,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, backing off"
            );
        };
        let operation = || {
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_rate_limited() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        };

        Retry::new(InjectedSleeper(sleeper), self.schedule(), notify, operation).await
    }
}

/// Wraps a backoff so it yields at most `retries_left` more delays.
#[derive(Debug)]
pub struct AttemptBounded<B> {
    inner: B,
    retries_left: u32,
}

impl<B: Backoff> Backoff for AttemptBounded<B> {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        self.inner.next_backoff()
    }
}

/// Adapts our `Sleeper` to the one `backoff` drives its retries with.
struct InjectedSleeper(Arc<dyn Sleeper>);

impl backoff::future::Sleeper for InjectedSleeper {
    type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

    fn sleep(&self, dur: Duration) -> Self::Sleep {
        let sleeper = self.0.clone();
        Box::pin(async move { sleeper.sleep(dur).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
