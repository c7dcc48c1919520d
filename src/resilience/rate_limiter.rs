use crate::clock::{default_clock, Clock};
use crate::error::{Error, RateLimitOrigin};
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// What `acquire()` does when the bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Sleep until the next refill and take that token.
    #[default]
    Wait,
    /// Fail with a retryable `RateLimited` error carrying the wait.
    Reject,
}

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub capacity: u32,
    pub tokens: u32,
    pub refill_interval_ms: u64,
    /// Estimated wait until a token is available (ms), if currently empty or blocked.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum tokens the bucket holds.
    pub capacity: u32,
    /// One token is added per whole interval.
    pub refill_interval: Duration,
    pub mode: AdmissionMode,
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self {
            capacity: 1,
            refill_interval: Duration::from_millis(2000),
            mode: AdmissionMode::Wait,
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }

    pub fn with_mode(mut self, mode: AdmissionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::configuration("rate limiter capacity must be at least 1"));
        }
        if self.refill_interval.is_zero() {
            return Err(Error::configuration(
                "rate limiter refill interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    tokens: u32,
    last_refill: Instant,
    /// Set after the downstream answered 429 with a Retry-After hint.
    blocked_until: Option<Instant>,
}

/// Token-bucket admission control in front of the transport.
///
/// The bucket starts full. While it is full the refill clock is idle, so a token
/// consumed from a full bucket is replaced no earlier than one interval later.
/// This keeps admissions within any window of `refill_interval` at or below
/// `capacity`.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Result<Self> {
        Self::with_clock(cfg, default_clock())
    }

    /// Fails with a configuration error for zero capacity or a zero refill interval.
    pub fn with_clock(cfg: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        cfg.validate()?;
        let state = Mutex::new(State {
            tokens: cfg.capacity,
            last_refill: clock.now(),
            blocked_until: None,
        });
        Ok(Self { cfg, clock, state })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) {
        if st.tokens >= cfg.capacity {
            st.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(st.last_refill);
        let intervals = elapsed.as_nanos() / cfg.refill_interval.as_nanos();
        if intervals == 0 {
            return;
        }
        let added = u32::try_from(intervals).unwrap_or(u32::MAX);
        st.tokens = st.tokens.saturating_add(added).min(cfg.capacity);
        if st.tokens >= cfg.capacity {
            st.last_refill = now;
        } else {
            // Fewer than `capacity` intervals, so this fits in u32.
            st.last_refill += cfg.refill_interval * added;
        }
    }

    /// Check and consume in one step. Must stay synchronous: an `.await` between the
    /// availability check and the decrement would let two callers take one token.
    fn admit_locked(
        cfg: &RateLimiterConfig,
        st: &mut State,
        now: Instant,
    ) -> std::result::Result<(), Duration> {
        if let Some(until) = st.blocked_until {
            if until > now {
                return Err(until - now);
            }
            st.blocked_until = None;
        }

        Self::refill_locked(cfg, st, now);

        if st.tokens >= 1 {
            st.tokens -= 1;
            return Ok(());
        }

        let next = st.last_refill + cfg.refill_interval;
        Err(next.saturating_duration_since(now))
    }

    /// Acquire one token.
    ///
    /// In `Wait` mode this sleeps until a token is available. In `Reject` mode an
    /// empty bucket yields `Error::RateLimited` with the wait as its hint.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = self.clock.now();
                match Self::admit_locked(&self.cfg, &mut st, now) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            match self.cfg.mode {
                AdmissionMode::Wait => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for token");
                    self.clock.sleep(wait).await;
                }
                AdmissionMode::Reject => {
                    return Err(Error::rate_limited(
                        Some(ceil_millis(wait)),
                        RateLimitOrigin::Local,
                    ));
                }
            }
        }
    }

    /// Try to acquire a token without waiting, returns true if successful
    pub async fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().await;
        let now = self.clock.now();
        Self::admit_locked(&self.cfg, &mut st, now).is_ok()
    }

    /// Hold back all admissions for `duration` (e.g. after a 429 with Retry-After).
    ///
    /// An existing, longer block is kept.
    pub async fn block_for(&self, duration: Duration) {
        let mut st = self.state.lock().await;
        let until = self.clock.now() + duration;
        st.blocked_until = Some(match st.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let now = self.clock.now();
        Self::refill_locked(&self.cfg, &mut st, now);

        let mut wait_ms = st
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| ceil_millis(until - now));

        if st.tokens == 0 {
            let next = st.last_refill + self.cfg.refill_interval;
            let local = ceil_millis(next.saturating_duration_since(now));
            wait_ms = Some(wait_ms.unwrap_or(0).max(local));
        }

        RateLimiterSnapshot {
            capacity: self.cfg.capacity,
            tokens: st.tokens,
            refill_interval_ms: self.cfg.refill_interval.as_millis() as u64,
            estimated_wait_ms: wait_ms,
        }
    }
}

fn ceil_millis(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    if d.subsec_nanos() % 1_000_000 != 0 {
        ms + 1
    } else {
        ms
    }
}
