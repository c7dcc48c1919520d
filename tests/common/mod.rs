//! Scripted fake transport for scheduler tests.
//!
//! Records when each call started and finished and how many calls overlapped, so
//! tests can check ordering and admission timing under paused tokio time.

#![allow(dead_code)]

use async_trait::async_trait;
use prompt_governor::cache::{CacheBackend, CacheEntry, CacheKey, MemoryCache};
use prompt_governor::{Error, GovernorConfig, Payload, Result, Scheduler, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Status { status: u16, retry_after_ms: Option<u64> },
    Network,
}

impl Step {
    pub fn status(status: u16) -> Self {
        Step::Status {
            status,
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Step::Status {
            status: 429,
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub prompt: String,
    pub started: Instant,
    pub finished: Instant,
}

pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    /// Used once the script runs out; `None` echoes the prompt back.
    fallback: Option<Step>,
    latency: Duration,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn echo() -> Arc<Self> {
        Self::build(Vec::new(), None, Duration::ZERO)
    }

    pub fn echo_with_latency(latency: Duration) -> Arc<Self> {
        Self::build(Vec::new(), None, latency)
    }

    pub fn scripted(steps: Vec<Step>) -> Arc<Self> {
        Self::build(steps, None, Duration::ZERO)
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::build(Vec::new(), Some(step), Duration::ZERO)
    }

    fn build(steps: Vec<Step>, fallback: Option<Step>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            fallback,
            latency,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.prompt).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, payload: &Payload) -> Result<String> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let started = Instant::now();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(CallRecord {
            prompt: payload.prompt.clone(),
            started,
            finished: Instant::now(),
        });

        match step {
            None => Ok(format!("reply: {}", payload.prompt)),
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Status {
                status,
                retry_after_ms,
            }) => Err(Error::from_status(status, "scripted", retry_after_ms)),
            Some(Step::Network) => Err(Error::network("connection refused")),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Config with the given bucket and a 100ms initial backoff.
pub fn config(capacity: u32, refill_interval_ms: u64) -> GovernorConfig {
    let mut cfg = GovernorConfig::default();
    cfg.rate_limit.capacity = capacity;
    cfg.rate_limit.refill_interval_ms = refill_interval_ms;
    cfg.retry.initial_backoff_ms = 100;
    cfg
}

pub fn scheduler(cfg: GovernorConfig, transport: Arc<ScriptedTransport>) -> Scheduler {
    Scheduler::builder()
        .config(cfg)
        .transport(transport)
        .build()
        .expect("scheduler builds")
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// `actual` is within a few milliseconds after `expected`.
pub fn assert_near(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + ms(50),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

/// Cache backend whose first lookup is slow; later lookups return at once.
pub struct SlowFirstLookup {
    inner: MemoryCache,
    delay: Duration,
    lookups: AtomicUsize,
}

impl SlowFirstLookup {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryCache::new(),
            delay,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CacheBackend for SlowFirstLookup {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &CacheKey, response: &str) -> Result<()> {
        self.inner.put(key, response).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    fn name(&self) -> &'static str {
        "slow_first_lookup"
    }
}

/// Shared buffer for formatted `tracing` output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route debug-level events on this thread into a buffer until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(buffer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
