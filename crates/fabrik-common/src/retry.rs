//! Retry schedules for transient store and director failures
//!
//! Watch registration retries on a fixed delay forever
//! ([`RetryConfig::fixed_forever`]): without a watch no reconciliation work
//! arrives at all. Deployment unlocks use a bounded fixed schedule.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// How many times an operation is attempted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempts {
    /// Give up after this many attempts
    Limited(u32),
    /// Never give up
    Unlimited,
}

impl Attempts {
    fn exhausted(&self, made: u32) -> bool {
        match self {
            Self::Limited(max) => made >= *max,
            Self::Unlimited => false,
        }
    }
}

/// Retry schedule
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempt limit
    pub attempts: Attempts,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for a grown delay
    pub max_delay: Duration,
    /// Growth factor applied after each failure (1.0 keeps the delay fixed)
    pub multiplier: f64,
    /// Spread each delay over 0.5x-1.5x so competing brokers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::exponential(Attempts::Unlimited)
    }
}

impl RetryConfig {
    /// Doubling delays from 100ms up to 30s, jittered
    pub fn exponential(attempts: Attempts) -> Self {
        Self {
            attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Same delay between attempts, forever
    pub fn fixed_forever(delay: Duration) -> Self {
        Self {
            attempts: Attempts::Unlimited,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Same delay between attempts, at most `attempts` attempts
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: Attempts::Limited(attempts),
            ..Self::fixed_forever(delay)
        }
    }

    fn grow(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.multiplier).min(self.max_delay)
    }

    fn spread(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds or `config` gives up
///
/// Returns the last error once the attempt limit is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut made = 0u32;
    let mut delay = config.initial_delay;

    loop {
        made += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if config.attempts.exhausted(made) {
            error!(operation = %operation_name, attempts = made, error = %e, "Giving up");
            return Err(e);
        }

        let wait = config.spread(delay);
        warn!(
            operation = %operation_name,
            attempt = made,
            error = %e,
            retry_in_ms = wait.as_millis() as u64,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(wait).await;
        delay = config.grow(delay);
    }
}
