//! # prompt-governor
//!
//! Outbound request governor for a hosted text-generation service: a
//! single-flight, rate-limited, retrying, cache-aware request scheduler.
//!
//! ## Overview
//!
//! Callers hand over an already-built prompt plus opaque attachments and get back
//! the generated text or one classified error. Between the two sits a fixed
//! pipeline:
//!
//! 1. **Validation**: empty prompts are rejected before queueing
//! 2. **Cache**: identical `(prompt, attachments)` are answered from memory
//! 3. **FIFO queue**: one worker services jobs strictly in submission order
//! 4. **Rate limiter**: token bucket admission (default 1 call per 2 s)
//! 5. **Retry**: exponential backoff, honouring server `Retry-After` hints
//! 6. **Transport**: exactly one HTTP call per attempt, classified result
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use prompt_governor::{GovernorConfig, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> prompt_governor::Result<()> {
//!     prompt_governor::telemetry::init_tracing();
//!
//!     let config = GovernorConfig::from_env()?;
//!     let governor = Scheduler::from_config(config)?;
//!
//!     match governor.send_message("Summarize the attached report", vec![]).await {
//!         Ok(text) => println!("{}", text),
//!         Err(e) => eprintln!("{}", e.user_message()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`scheduler`] | FIFO single-flight orchestration and the caller API |
//! | [`resilience`] | Token bucket rate limiter and retry policy |
//! | [`cache`] | Fingerprint-keyed response memoization |
//! | [`transport`] | Single-attempt downstream calls and context budget |
//! | [`config`] | YAML/env configuration |
//! | [`clock`] | Injectable time source |
//! | [`error_code`] | Error kinds and HTTP status classification |
//! | [`telemetry`] | Logging setup |

pub mod cache;
pub mod clock;
pub mod config;
pub mod error_code;
pub mod resilience;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, TokioClock};
pub use config::GovernorConfig;
pub use error_code::ErrorKind;
pub use scheduler::{CancellationPolicy, Job, JobState, Scheduler, SchedulerBuilder, SchedulerStats};
pub use transport::{Attachment, HttpTransport, Payload, Transport};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
