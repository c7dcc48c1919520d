//! Time source used by the rate limiter and retry backoff.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock plus sleep primitive.
///
/// Injected into the scheduler so tests can drive time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by `tokio::time`.
///
/// Under `#[tokio::test(start_paused = true)]` time only advances while every task
/// is idle, which makes timing assertions exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(TokioClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleep_advances_now() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(1500)).await;
        assert!(clock.now() - start >= Duration::from_millis(1500));
    }
}
