//! Bounded retry with exponential backoff.
//!
//! The retry decision is a plain function of `(error, attempt)` so it can be tested
//! without timers. `RetryPolicy::run` drives the loop iteratively and sleeps through
//! the injected [`Clock`].

use crate::clock::Clock;
use crate::error_code::ErrorKind;
use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound of the random jitter, as a fraction of the computed delay.
const MAX_JITTER_FRACTION: f64 = 0.3;

/// Configuration for retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Cap for the computed exponential delay. Server hints are not capped.
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(60),
            jitter: false,
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Fail,
}

/// Progress of one operation through the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    pub operation_id: String,
    /// Zero-based; the first try is attempt 0.
    pub attempt_number: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub next_backoff: Option<Duration>,
}

impl RetryAttempt {
    fn first(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            attempt_number: 0,
            last_error_kind: None,
            next_backoff: None,
        }
    }
}

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `initial_backoff * 2^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as u64;
        let cap = self.config.max_backoff.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }

    /// Retry decision for a given jitter fraction (0.0 means no jitter).
    ///
    /// An explicit wait hint on the error wins over a shorter computed delay.
    pub fn decide_with_jitter(&self, err: &Error, attempt: u32, jitter: f64) -> Decision {
        if !err.is_retryable() || attempt >= self.config.max_retries {
            return Decision::Fail;
        }

        let computed = self.backoff(attempt);
        let computed = computed + computed.mul_f64(jitter.clamp(0.0, MAX_JITTER_FRACTION));

        let delay = match err.retry_after_ms() {
            Some(hint) => Duration::from_millis(hint).max(computed),
            None => computed,
        };
        Decision::Retry { delay }
    }

    pub fn decide(&self, err: &Error, attempt: u32) -> Decision {
        let jitter = if self.config.jitter {
            rand::thread_rng().gen_range(0.0..MAX_JITTER_FRACTION)
        } else {
            0.0
        };
        self.decide_with_jitter(err, attempt, jitter)
    }

    /// Run `operation` until it succeeds, fails terminally, or retries run out.
    ///
    /// Makes at most `max_retries + 1` attempts. The error of the last attempt is
    /// returned unchanged apart from its attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        clock: &dyn Clock,
        operation_id: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(&RetryAttempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryAttempt::first(operation_id);

        loop {
            let err = match operation(&state).await {
                Ok(value) => {
                    if state.attempt_number > 0 {
                        debug!(
                            operation_id,
                            attempts = state.attempt_number + 1,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e.at_attempt(state.attempt_number),
            };

            match self.decide(&err, state.attempt_number) {
                Decision::Retry { delay } => {
                    warn!(
                        operation_id,
                        attempt = state.attempt_number,
                        error_kind = err.kind().name(),
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, backing off"
                    );
                    state.last_error_kind = Some(err.kind());
                    state.next_backoff = Some(delay);
                    if !delay.is_zero() {
                        clock.sleep(delay).await;
                    }
                    state.attempt_number += 1;
                }
                Decision::Fail => {
                    warn!(
                        operation_id,
                        attempt = state.attempt_number,
                        error_kind = err.kind().name(),
                        retryable = err.is_retryable(),
                        "operation failed terminally"
                    );
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
