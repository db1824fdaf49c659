//! Process-wide token bucket for the cloud API budget
//!
//! Every cloud call made during convergence draws from one shared
//! [`RateLimiter`]. Waiting for budget is bound to the caller's
//! [`ExecutionScope`]: if the bucket cannot refill before the scope's deadline
//! the wait fails immediately with a deadline error instead of sleeping.
//!
//! Tokens are reserved under the lock before sleeping, so concurrent waiters
//! never spend the same budget twice. A waiter whose scope ends mid-sleep hands
//! its reservation back.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Step};
use crate::scope::ExecutionScope;

/// Default sustained cloud API calls per second
pub const DEFAULT_API_QPS: f64 = 10.0;

/// Default cloud API burst capacity
pub const DEFAULT_API_BURST: u32 = 100;

/// Configuration for the cloud API rate limiter
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens added per second; non-finite means unlimited
    pub qps: f64,
    /// Maximum tokens the bucket holds
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            qps: DEFAULT_API_QPS,
            burst: DEFAULT_API_BURST,
        }
    }
}

impl RateLimitConfig {
    /// A configuration that never throttles
    pub fn unlimited() -> Self {
        Self {
            qps: f64::INFINITY,
            burst: u32::MAX,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    /// May go negative while reservations are outstanding
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by all reconcile passes
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = f64::from(config.burst);
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Limiter configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn is_unlimited(&self) -> bool {
        !self.config.qps.is_finite()
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.config.qps.max(0.0))
            .min(f64::from(self.config.burst));
        bucket.last_refill = now;
    }

    /// Tokens currently available (negative while waiters hold reservations)
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    /// Take `n` tokens if they are available right now
    pub fn try_acquire(&self, n: u32) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= f64::from(n) {
            bucket.tokens -= f64::from(n);
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens are available, bounded by `scope`
    ///
    /// Fails fast with [`Error::DeadlineExceeded`] when the required wait ends
    /// after the scope's deadline; nothing is consumed in that case.
    pub async fn wait(&self, scope: &ExecutionScope, n: u32) -> Result<(), Error> {
        scope.check(Step::RateLimit)?;
        if self.is_unlimited() {
            return Ok(());
        }
        if n > self.config.burst {
            return Err(Error::transient(
                Step::RateLimit,
                format!("requested {} tokens exceeds burst {}", n, self.config.burst),
            ));
        }

        let delay = {
            let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            self.refill(&mut bucket, now);

            let deficit = f64::from(n) - bucket.tokens;
            let delay = if deficit > 0.0 {
                // A refill rate of zero (or close to it) never produces the tokens
                match Duration::try_from_secs_f64(deficit / self.config.qps) {
                    Ok(delay) => delay,
                    Err(_) => {
                        debug!(tokens = n, qps = self.config.qps, "rate limit wait is unbounded");
                        return Err(Error::deadline_exceeded(Step::RateLimit));
                    }
                }
            } else {
                Duration::ZERO
            };

            if let Some(deadline) = scope.deadline() {
                if now + delay > deadline {
                    debug!(
                        tokens = n,
                        wait_ms = delay.as_millis() as u64,
                        "rate limit wait would exceed deadline"
                    );
                    return Err(Error::deadline_exceeded(Step::RateLimit));
                }
            }

            bucket.tokens -= f64::from(n);
            delay
        };

        if delay.is_zero() {
            return Ok(());
        }

        debug!(tokens = n, wait_ms = delay.as_millis() as u64, "waiting for cloud API budget");
        if let Err(e) = scope.sleep(Step::RateLimit, delay).await {
            self.release(n);
            return Err(e);
        }
        Ok(())
    }

    fn release(&self, n: u32) {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.tokens = (bucket.tokens + f64::from(n)).min(f64::from(self.config.burst));
    }
}
