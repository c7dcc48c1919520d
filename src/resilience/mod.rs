//! Resilience primitives guarding the downstream generation service.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Token bucket admission control in front of the transport |
//! | [`retry`] | Bounded exponential backoff around a single attempt |
//!
//! ## Rate Limiter
//!
//! ```rust
//! use prompt_governor::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> prompt_governor::Result<()> {
//! let config = RateLimiterConfig::new()
//!     .with_capacity(1)
//!     .with_refill_interval(Duration::from_millis(2000));
//! let limiter = RateLimiter::new(config)?;
//!
//! if limiter.try_acquire().await {
//!     // Proceed with request...
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry
//!
//! ```rust
//! use prompt_governor::resilience::retry::{Decision, RetryConfig, RetryPolicy};
//! use prompt_governor::Error;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(RetryConfig::new().with_max_retries(3));
//! let err = Error::from_status(429, "", Some(5000));
//! assert_eq!(
//!     policy.decide_with_jitter(&err, 0, 0.0),
//!     Decision::Retry { delay: Duration::from_millis(5000) }
//! );
//! ```

pub mod rate_limiter;
pub mod retry;
