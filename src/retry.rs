//! Backoff and polling helpers
//!
//! [`Backoff`] produces the jittered exponential delays the runtime waits
//! between reconcile attempts that failed transiently. [`wait_for`] polls a
//! condition until it holds or a timeout expires.
//!
//! # Example
//!
//! ```ignore
//! use bootstrap_manifests::retry::{Backoff, RetryConfig};
//!
//! let mut backoff = Backoff::new(RetryConfig::default());
//! while let Some(delay) = backoff.next_delay() {
//!     tokio::time::sleep(delay).await;
//!     // ...
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::Error;

/// Exponential backoff policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "millis", rename = "initialDelayMs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "millis", rename = "maxDelayMs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Stateful delay generator for one retry sequence
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    /// Start a fresh sequence
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            delay,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` retries
    /// have been handed out
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        // Exponential backoff, capped at max_delay
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        Some(jittered)
    }

    /// Retries handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}

/// Poll until a condition is met or `timeout` expires
///
/// `poll_fn` returns `Ok(Some(T))` when ready, `Ok(None)` to keep waiting,
/// or an error, which is logged and treated as "not ready yet".
pub async fn wait_for<T, F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut poll_fn: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let start = Instant::now();

    loop {
        match poll_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Poll error for {}, retrying...", description);
            }
        }

        if start.elapsed() > timeout {
            return Err(Error::internal_with_context(
                "wait_for",
                format!("timeout after {:?} waiting for {}", timeout, description),
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Default poll interval for [`wait_for`] in tests and tooling
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for [`wait_for`] in tests and tooling
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
