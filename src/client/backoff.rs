//! Retry delays for the connection supervisor.

use std::time::Duration;

/// How reconnect attempts are spaced out.
///
/// The n-th retry waits `init_delay * factor^(n-1)`, capped at `max_delay`.
/// With `jitter > 0` the delay is shortened by a random fraction in
/// `[0, jitter)` so that many clients do not reconnect in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub init_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// A connection that stayed up this long resets the retry counter.
    pub reset_threshold: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.2,
            max_retries: None,
            reset_threshold: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Undelayed-by-randomness delay for the given 1-based retry.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.init_delay.as_millis() as f64 * self.factor.max(1.0).powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, base: Duration) -> Duration {
        // non-finite values (e.g. NaN from the environment) disable jitter
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let cut = rand::random_range(0.0..jitter);
        base.mul_f64(1.0 - cut)
    }
}

/// Retry counter driven by a `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.retries >= max {
                return None;
            }
        }
        self.retries = self.retries.saturating_add(1);
        Some(self.policy.jittered(self.policy.base_delay(self.retries)))
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
