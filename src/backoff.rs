// src/backoff.rs

use std::time::Duration;

/// Delay to wait before the next attempt of a chunk, given how many attempts failed so far.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, retry_count: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, retry_count: u32) -> Duration {
        self(retry_count)
    }
}

/// `base * retry_count`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub base: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        self.base.saturating_mul(retry_count)
    }
}

/// `base * 2^(retry_count - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}
