//! Single-flight request scheduler.
//!
//! Every caller's job goes into one FIFO channel. A single worker task takes one
//! entry at a time and carries it all the way to a terminal result before it
//! receives the next one, so at most one downstream call is ever in flight and
//! jobs are serviced in submission order.
//!
//! ```text
//! enqueue ─► cache hit? ──yes──► return
//!               │no
//!               ▼
//!          FIFO channel ─► worker: cache re-check ─► limiter.acquire
//!                                   ─► retry.run(transport.call) ─► cache.put ─► respond
//! ```
//!
//! A job answered by the fast-path cache check never enters the queue, so it may
//! resolve ahead of earlier jobs that are still waiting.

mod job;

pub use job::{Job, JobState};

use crate::cache::{CacheBackend, CacheKey, CacheKeyGenerator, CacheStats, MemoryCache, ResponseCache};
use crate::clock::{default_clock, Clock};
use crate::config::GovernorConfig;
use crate::error::RateLimitOrigin;
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterSnapshot};
use crate::resilience::retry::RetryPolicy;
use crate::transport::{Attachment, HttpTransport, Transport};
use crate::{Error, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// What happens to a queued job whose caller stopped waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Skip it when it reaches the head of the queue. No token is consumed.
    /// Work that has already been admitted still runs to completion.
    #[default]
    SkipAbandoned,
    /// Service it anyway; the result is cached but nobody receives it.
    RunToCompletion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub abandoned: u64,
    pub queue_depth: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    abandoned: AtomicU64,
    queue_depth: AtomicU64,
}

struct QueueEntry {
    job: Job,
    key: CacheKey,
    respond_to: oneshot::Sender<Result<String>>,
}

/// State shared between handles and the worker. Holds no queue sender, so the
/// worker stops once every `Scheduler` handle is gone.
struct Core {
    limiter: RateLimiter,
    cache: ResponseCache,
    keys: CacheKeyGenerator,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    cancellation: CancellationPolicy,
    counters: Counters,
    next_id: AtomicU64,
}

/// Cheap, cloneable handle to one governor instance.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
    queue: Arc<Mutex<Option<mpsc::UnboundedSender<QueueEntry>>>>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn new(
        config: GovernorConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        SchedulerBuilder::new()
            .config(config)
            .transport(transport)
            .clock(clock)
            .build()
    }

    /// HTTP transport and tokio clock, configured from `config`.
    pub fn from_config(config: GovernorConfig) -> Result<Self> {
        SchedulerBuilder::new().config(config).build()
    }

    /// Submit a prompt with its attachments and wait for the generated text.
    pub async fn send_message(
        &self,
        prompt: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<String> {
        self.enqueue(Job::new(prompt, attachments)).await
    }

    /// Queue a job and wait for its terminal result.
    ///
    /// Empty prompts are rejected before queueing. Terminal failures come back
    /// wrapped in `Error::Job`.
    pub async fn enqueue(&self, mut job: Job) -> Result<String> {
        if job.prompt.trim().is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }

        let core = &self.core;
        core.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let key = core.keys.generate(&job.prompt, &job.attachments);
        if let Some(hit) = core.cached(&key).await {
            core.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            job.id = core.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(job_id = job.id, state = %JobState::CacheHit, "served from cache");
            return Ok(hit);
        }

        let (tx, rx) = oneshot::channel();
        let job_id = {
            let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let sender = queue.as_ref().ok_or(Error::SchedulerClosed)?;
            // Ids are taken under the queue lock so they follow channel order.
            job.id = core.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let job_id = job.id;
            let entry = QueueEntry {
                job,
                key,
                respond_to: tx,
            };
            // Count before sending so the worker never decrements below zero.
            core.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
            if sender.send(entry).is_err() {
                core.counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
                return Err(Error::SchedulerClosed);
            }
            job_id
        };
        debug!(job_id, state = %JobState::Queued, "job queued");

        rx.await.unwrap_or(Err(Error::SchedulerClosed))
    }

    /// Stop accepting jobs. Jobs already queued are still serviced.
    pub fn shutdown(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.queue
            .lock()
            .map(|q| q.as_ref().map_or(true, |s| s.is_closed()))
            .unwrap_or(true)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.core.counters;
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            queue_depth: c.queue_depth.load(Ordering::Relaxed),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub async fn rate_limiter_snapshot(&self) -> RateLimiterSnapshot {
        self.core.limiter.snapshot().await
    }
}

impl Core {
    /// Cache lookup where a backend failure counts as a miss.
    async fn cached(&self, key: &CacheKey) -> Option<String> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueueEntry>) {
        debug!("request scheduler worker started");
        while let Some(entry) = rx.recv().await {
            self.counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.service(entry).await;
        }
        debug!("request scheduler worker stopped");
    }

    /// Carry one entry to a terminal result. Only ever called by the worker.
    async fn service(&self, entry: QueueEntry) {
        let QueueEntry {
            job,
            key,
            respond_to,
        } = entry;
        let job_id = job.id;

        if self.cancellation == CancellationPolicy::SkipAbandoned && respond_to.is_closed() {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(job_id, state = %JobState::Abandoned, "caller gone before service, skipping job");
            return;
        }

        // An identical job ahead of this one may have filled the cache meanwhile.
        if let Some(hit) = self.cached(&key).await {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(job_id, state = %JobState::CacheHit, "served from cache at head of queue");
            let _ = respond_to.send(Ok(hit));
            return;
        }

        let queued_ms = job.submitted_at.elapsed().as_millis() as u64;
        let payload = job.into_payload();
        let request_id = payload.request_id.clone();

        let payload_ref = &payload;
        let result = self
            .retry
            .run(self.clock.as_ref(), &request_id, |attempt| {
                let attempt_number = attempt.attempt_number;
                let backoff_ms = attempt.next_backoff.map(|d| d.as_millis() as u64);
                let last_error = attempt.last_error_kind.map_or("none", |k| k.name());
                async move {
                    if let Some(backoff_ms) = backoff_ms {
                        debug!(
                            job_id,
                            attempt = attempt_number,
                            backoff_ms,
                            last_error,
                            state = %JobState::Backoff,
                            "backoff elapsed, retrying"
                        );
                    }
                    self.limiter.acquire().await?;
                    debug!(job_id, attempt = attempt_number, state = %JobState::Admitted, "token acquired");
                    debug!(job_id, attempt = attempt_number, state = %JobState::Sent, "calling transport");
                    let res = self.transport.call(payload_ref).await;
                    if let Err(Error::RateLimited {
                        retry_after_ms: Some(ms),
                        origin: RateLimitOrigin::Remote,
                        ..
                    }) = &res
                    {
                        self.limiter.block_for(Duration::from_millis(*ms)).await;
                    }
                    res
                }
            })
            .await;

        let outcome = match result {
            Ok(text) => {
                if let Err(e) = self.cache.put(&key, &text).await {
                    warn!(job_id, error = %e, "failed to store response in cache");
                }
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(job_id, request_id = %request_id, queued_ms, state = %JobState::Succeeded, "job completed");
                Ok(text)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id,
                    request_id = %request_id,
                    error_kind = e.kind().name(),
                    state = %JobState::FailedTerminal,
                    "job failed"
                );
                Err(Error::Job {
                    job_id,
                    request_id,
                    source: Box::new(e),
                })
            }
        };

        if respond_to.send(outcome).is_err() {
            debug!(job_id, "caller dropped before result was delivered");
        }
    }
}

/// Builder for [`Scheduler`].
///
/// Defaults: [`GovernorConfig::default`], an [`HttpTransport`] built from the
/// config, the tokio clock and an in-memory cache.
pub struct SchedulerBuilder {
    config: GovernorConfig,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    cache_backend: Option<Box<dyn CacheBackend>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: GovernorConfig::default(),
            transport: None,
            clock: None,
            cache_backend: None,
        }
    }

    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the cache storage. Ignored when caching is disabled in the config.
    pub fn cache_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Validate the config and spawn the worker on the current tokio runtime.
    pub fn build(self) -> Result<Scheduler> {
        let cfg = self.config;
        cfg.validate()?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::configuration("Scheduler must be built inside a tokio runtime")
        })?;

        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&cfg.transport)?),
        };
        let clock = self.clock.unwrap_or_else(default_clock);

        let cache = if cfg.cache.enabled {
            ResponseCache::new(
                self.cache_backend
                    .unwrap_or_else(|| Box::new(MemoryCache::new())),
            )
        } else {
            ResponseCache::disabled()
        };
        let keys = match &cfg.cache.salt {
            Some(salt) => CacheKeyGenerator::new().with_salt(salt.clone()),
            None => CacheKeyGenerator::new(),
        };

        let core = Arc::new(Core {
            limiter: RateLimiter::with_clock(cfg.rate_limiter_config(), clock.clone())?,
            cache,
            keys,
            retry: RetryPolicy::new(cfg.retry_config()),
            transport,
            clock,
            cancellation: cfg.cancellation,
            counters: Counters::default(),
            next_id: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(core.clone().run_worker(rx));

        info!(
            capacity = cfg.rate_limit.capacity,
            refill_interval_ms = cfg.rate_limit.refill_interval_ms,
            max_retries = cfg.retry.max_retries,
            cache = core.cache.backend_name(),
            transport = core.transport.name(),
            "request scheduler started"
        );

        Ok(Scheduler {
            core,
            queue: Arc::new(Mutex::new(Some(tx))),
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
