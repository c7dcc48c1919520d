//! Scheduler behaviour under paused tokio time.
//!
//! Every test drives a `ScriptedTransport`, so timings are exact virtual
//! milliseconds measured from the test's own start instant.

mod common;

use common::{assert_near, capture_logs, config, ms, scheduler, ScriptedTransport, SlowFirstLookup, Step};
use futures::future::join_all;
use prompt_governor::resilience::rate_limiter::AdmissionMode;
use prompt_governor::{Attachment, CancellationPolicy, Error, ErrorKind, Scheduler};
use tokio::time::Instant;

fn offsets(transport: &ScriptedTransport, start: Instant) -> Vec<std::time::Duration> {
    transport
        .calls()
        .iter()
        .map(|c| c.started.duration_since(start))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn jobs_are_serviced_one_at_a_time_in_submission_order() {
    let transport = ScriptedTransport::echo_with_latency(ms(300));
    let s = scheduler(config(10, 100), transport.clone());

    let prompts: Vec<String> = (1..=5).map(|i| format!("job {}", i)).collect();
    let results = join_all(prompts.iter().map(|p| s.send_message(p.clone(), vec![]))).await;

    for (prompt, result) in prompts.iter().zip(&results) {
        assert_eq!(result.as_ref().unwrap(), &format!("reply: {}", prompt));
    }
    assert_eq!(transport.prompts(), prompts);
    assert_eq!(transport.max_in_flight(), 1);

    let calls = transport.calls();
    for pair in calls.windows(2) {
        assert!(pair[1].started >= pair[0].finished);
    }
}

#[tokio::test(start_paused = true)]
async fn identical_jobs_reach_the_transport_once() {
    let transport = ScriptedTransport::echo();
    let s = scheduler(config(5, 100), transport.clone());
    let attachment = Attachment::new("notes.txt", "text/plain", &b"quarterly numbers"[..]);

    let results = join_all([
        s.send_message("summarize", vec![attachment.clone()]),
        s.send_message("summarize", vec![attachment.clone()]),
    ])
    .await;
    assert_eq!(results[0].as_ref().unwrap(), "reply: summarize");
    assert_eq!(results[1].as_ref().unwrap(), "reply: summarize");
    assert_eq!(transport.call_count(), 1);

    // Answered on the fast path without touching the queue.
    let third = s.send_message("summarize", vec![attachment]).await.unwrap();
    assert_eq!(third, "reply: summarize");
    assert_eq!(transport.call_count(), 1);

    let stats = s.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(s.cache_stats().puts, 1);
}

#[tokio::test(start_paused = true)]
async fn different_attachments_are_different_jobs() {
    let transport = ScriptedTransport::echo();
    let s = scheduler(config(5, 100), transport.clone());

    let a = Attachment::new("data.csv", "text/csv", &b"a,b\n1,2"[..]);
    let b = Attachment::new("data.csv", "text/csv", &b"a,b\n3,4"[..]);
    s.send_message("analyze", vec![a]).await.unwrap();
    s.send_message("analyze", vec![b]).await.unwrap();
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn admissions_respect_the_refill_window() {
    let transport = ScriptedTransport::echo();
    let s = scheduler(config(2, 1000), transport.clone());
    let start = Instant::now();

    let results = join_all((0..5).map(|i| s.send_message(format!("p{}", i), vec![]))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let starts = offsets(&transport, start);
    let expected = [0, 0, 1000, 2000, 3000];
    assert_eq!(starts.len(), expected.len());
    for (actual, want) in starts.iter().zip(expected) {
        assert_near(*actual, ms(want));
    }

    // No window of one refill interval ever holds more than `capacity` admissions.
    for (i, a) in starts.iter().enumerate() {
        let in_window = starts[i..].iter().filter(|b| **b < *a + ms(1000)).count();
        assert!(in_window <= 2, "window at {:?} held {}", a, in_window);
    }
}

#[tokio::test(start_paused = true)]
async fn three_jobs_with_default_limits_start_two_seconds_apart() {
    let transport = ScriptedTransport::echo();
    let mut cfg = prompt_governor::GovernorConfig::default();
    cfg.retry.initial_backoff_ms = 100;
    let s = scheduler(cfg, transport.clone());
    let start = Instant::now();

    let results = join_all([
        s.send_message("first", vec![]),
        s.send_message("second", vec![]),
        s.send_message("third", vec![]),
    ])
    .await;
    assert!(results.iter().all(|r| r.is_ok()));

    let starts = offsets(&transport, start);
    assert_near(starts[0], ms(0));
    assert_near(starts[1], ms(2000));
    assert_near(starts[2], ms(4000));
}

#[tokio::test(start_paused = true)]
async fn server_retry_after_is_honoured() {
    let transport = ScriptedTransport::scripted(vec![
        Step::rate_limited(5000),
        Step::Reply("finally".into()),
    ]);
    let s = scheduler(config(10, 100), transport.clone());
    let start = Instant::now();

    let text = s.send_message("busy service", vec![]).await.unwrap();
    assert_eq!(text, "finally");

    let starts = offsets(&transport, start);
    assert_eq!(starts.len(), 2);
    assert!(starts[1] - starts[0] >= ms(5000), "gap {:?}", starts[1] - starts[0]);
}

#[tokio::test(start_paused = true)]
async fn retry_after_holds_back_the_next_job_too() {
    // One 429 exhausts retries for the first job (max_retries = 0), and the
    // pause it requested still applies to the job behind it.
    let transport = ScriptedTransport::scripted(vec![Step::rate_limited(3000)]);
    let mut cfg = config(10, 100);
    cfg.retry.max_retries = 0;
    let s = scheduler(cfg, transport.clone());
    let start = Instant::now();

    let results = join_all([s.send_message("a", vec![]), s.send_message("b", vec![])]).await;
    assert_eq!(results[0].as_ref().unwrap_err().kind(), ErrorKind::RateLimited);
    assert!(results[1].is_ok());

    let starts = offsets(&transport, start);
    assert!(starts[1] >= ms(3000), "second job started at {:?}", starts[1]);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_max_retries() {
    let transport = ScriptedTransport::always(Step::status(503));
    let s = scheduler(config(10, 100), transport.clone());
    let start = Instant::now();

    let err = s.send_message("doomed", vec![]).await.unwrap_err();
    assert_eq!(transport.call_count(), 4);
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.status_code(), Some(503));
    assert_eq!(err.context().and_then(|c| c.attempt), Some(3));
    assert_eq!(err.user_message(), "Server error, try again later");

    // Backoff doubles from 100ms: 100, 200, 400.
    let starts = offsets(&transport, start);
    assert_near(starts[1] - starts[0], ms(100));
    assert_near(starts[2] - starts[1], ms(200));
    assert_near(starts[3] - starts[2], ms(400));

    match err {
        Error::Job { job_id, .. } => assert_eq!(job_id, 1),
        other => panic!("expected job error, got {:?}", other),
    }
    assert_eq!(s.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success() {
    let transport = ScriptedTransport::scripted(vec![Step::Network, Step::status(500)]);
    let s = scheduler(config(10, 100), transport.clone());

    let text = s.send_message("flaky", vec![]).await.unwrap();
    assert_eq!(text, "reply: flaky");
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_not_retried() {
    let transport = ScriptedTransport::always(Step::status(400));
    let s = scheduler(config(10, 100), transport.clone());

    let err = s.send_message("malformed", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Job { .. }));
    assert_eq!(err.kind(), ErrorKind::Client);
    assert!(!err.is_retryable());
    assert_eq!(err.user_message(), "Request rejected by the service (HTTP 400)");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failures_are_not_cached() {
    let transport = ScriptedTransport::scripted(vec![Step::status(400)]);
    let s = scheduler(config(10, 100), transport.clone());

    assert!(s.send_message("retry me later", vec![]).await.is_err());
    let text = s.send_message("retry me later", vec![]).await.unwrap();
    assert_eq!(text, "reply: retry me later");
    assert_eq!(transport.call_count(), 2);
    assert_eq!(s.stats().cache_hits, 0);
}

#[tokio::test(start_paused = true)]
async fn empty_prompt_is_rejected_without_queueing() {
    let transport = ScriptedTransport::echo();
    let s = scheduler(config(10, 100), transport.clone());

    for prompt in ["", "   \n\t"] {
        let err = s.send_message(prompt, vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.user_message(), "Prompt must not be empty");
    }
    assert_eq!(transport.call_count(), 0);
    assert_eq!(s.stats().submitted, 0);
}

#[tokio::test(start_paused = true)]
async fn network_failures_surface_as_network_errors() {
    let transport = ScriptedTransport::always(Step::Network);
    let mut cfg = config(10, 100);
    cfg.retry.max_retries = 1;
    let s = scheduler(cfg, transport.clone());

    let err = s.send_message("offline", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.user_message(), "Network error");
    assert_eq!(transport.call_count(), 2);
}

async fn abandonment_run(policy: CancellationPolicy) -> (Vec<std::time::Duration>, Vec<String>) {
    let transport = ScriptedTransport::echo_with_latency(ms(1000));
    let mut cfg = prompt_governor::GovernorConfig::default();
    cfg.cancellation = policy;
    let s = scheduler(cfg, transport.clone());
    let start = Instant::now();

    let (first, second, third) = futures::join!(
        s.send_message("one", vec![]),
        tokio::time::timeout(ms(100), s.send_message("two", vec![])),
        s.send_message("three", vec![]),
    );
    assert!(first.is_ok());
    assert!(second.is_err(), "second caller should have timed out");
    assert!(third.is_ok());

    // Let a run-to-completion job finish before inspecting the transport.
    tokio::time::sleep(ms(10_000)).await;
    (offsets(&transport, start), transport.prompts())
}

#[tokio::test(start_paused = true)]
async fn abandoned_jobs_are_skipped_by_default() {
    let (starts, prompts) = abandonment_run(CancellationPolicy::SkipAbandoned).await;
    assert_eq!(prompts, vec!["one", "three"]);
    assert_near(starts[1], ms(2000));
}

#[tokio::test(start_paused = true)]
async fn run_to_completion_services_abandoned_jobs() {
    let (starts, prompts) = abandonment_run(CancellationPolicy::RunToCompletion).await;
    assert_eq!(prompts, vec!["one", "two", "three"]);
    assert_near(starts[1], ms(2000));
    assert_near(starts[2], ms(4000));
}

#[tokio::test(start_paused = true)]
async fn abandoned_job_result_is_still_cached_when_run() {
    let transport = ScriptedTransport::echo_with_latency(ms(1000));
    let mut cfg = config(10, 100);
    cfg.cancellation = CancellationPolicy::RunToCompletion;
    let s = scheduler(cfg, transport.clone());

    let _ = tokio::time::timeout(ms(100), s.send_message("orphan", vec![])).await;
    tokio::time::sleep(ms(2000)).await;

    let text = s.send_message("orphan", vec![]).await.unwrap();
    assert_eq!(text, "reply: orphan");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_queue_then_rejects() {
    let transport = ScriptedTransport::echo_with_latency(ms(500));
    let s = scheduler(config(10, 100), transport.clone());

    let pending = {
        let s = s.clone();
        tokio::spawn(async move { s.send_message("queued before shutdown", vec![]).await })
    };
    tokio::time::sleep(ms(10)).await;

    s.shutdown();
    assert!(s.is_closed());

    let err = s.send_message("too late", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::SchedulerClosed));

    let text = pending.await.unwrap().unwrap();
    assert_eq!(text, "reply: queued before shutdown");
    assert_eq!(transport.prompts(), vec!["queued before shutdown"]);
}

#[tokio::test(start_paused = true)]
async fn reject_mode_fails_fast_once_retries_run_out() {
    let transport = ScriptedTransport::echo();
    let mut cfg = config(1, 2000);
    cfg.rate_limit.mode = AdmissionMode::Reject;
    cfg.retry.max_retries = 0;
    let s = scheduler(cfg, transport.clone());

    s.send_message("first", vec![]).await.unwrap();
    let err = s.send_message("second", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(err.user_message(), "Rate limit exceeded, retrying in 2s…");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reject_mode_recovers_through_retry() {
    let transport = ScriptedTransport::echo();
    let mut cfg = config(1, 2000);
    cfg.rate_limit.mode = AdmissionMode::Reject;
    let s = scheduler(cfg, transport.clone());
    let start = Instant::now();

    s.send_message("first", vec![]).await.unwrap();
    s.send_message("second", vec![]).await.unwrap();

    let starts = offsets(&transport, start);
    assert_near(starts[1], ms(2000));
}

#[tokio::test(start_paused = true)]
async fn limiter_snapshot_reflects_consumption() {
    let transport = ScriptedTransport::echo();
    let s = scheduler(config(2, 1000), transport);

    s.send_message("one", vec![]).await.unwrap();
    let snapshot = s.rate_limiter_snapshot().await;
    assert_eq!(snapshot.capacity, 2);
    assert_eq!(snapshot.tokens, 1);
    assert_eq!(snapshot.estimated_wait_ms, None);
}

#[test]
fn build_outside_runtime_is_a_configuration_error() {
    let err = Scheduler::builder()
        .transport(ScriptedTransport::echo())
        .build()
        .err()
        .expect("build must fail without a runtime");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn invalid_config_is_rejected_at_build() {
    let mut cfg = prompt_governor::GovernorConfig::default();
    cfg.rate_limit.capacity = 0;
    let result = Scheduler::builder()
        .config(cfg)
        .transport(ScriptedTransport::echo())
        .build();
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn cache_hit_resolves_on_first_poll() {
    let transport = ScriptedTransport::echo();
    let s = scheduler(config(5, 100), transport.clone());
    s.send_message("warm", vec![]).await.unwrap();

    let mut hit = tokio_test::task::spawn(s.send_message("warm", vec![]));
    let text = tokio_test::assert_ready_ok!(hit.poll());
    assert_eq!(text, "reply: warm");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_constructor_uses_injected_clock() {
    let transport = ScriptedTransport::echo();
    let s = Scheduler::new(
        config(1, 2000),
        transport.clone(),
        std::sync::Arc::new(prompt_governor::TokioClock),
    )
    .unwrap();
    let start = Instant::now();

    s.send_message("a", vec![]).await.unwrap();
    s.send_message("b", vec![]).await.unwrap();
    assert_near(offsets(&transport, start)[1], ms(2000));
}

#[tokio::test(start_paused = true)]
async fn job_ids_follow_queue_order_with_a_slow_cache() {
    let transport = ScriptedTransport::always(Step::status(400));
    let s = Scheduler::builder()
        .config(config(10, 100))
        .transport(transport.clone())
        .cache_backend(Box::new(SlowFirstLookup::new(ms(100))))
        .build()
        .unwrap();

    // The first caller's cache lookup stalls, so the second one is queued first.
    let results = join_all([s.send_message("first", vec![]), s.send_message("second", vec![])]).await;
    assert_eq!(transport.prompts(), vec!["second", "first"]);

    let ids: Vec<u64> = results
        .into_iter()
        .map(|r| match r.unwrap_err() {
            Error::Job { job_id, .. } => job_id,
            other => panic!("expected job error, got {:?}", other),
        })
        .collect();
    assert_eq!(ids, vec![2, 1]);
}

#[tokio::test(start_paused = true)]
async fn retry_delay_is_logged_as_backoff_state() {
    let (logs, _guard) = capture_logs();
    let transport = ScriptedTransport::scripted(vec![Step::status(503)]);
    let s = scheduler(config(10, 100), transport.clone());

    s.send_message("needs a retry", vec![]).await.unwrap();
    assert_eq!(transport.call_count(), 2);

    let output = logs.contents();
    assert!(output.contains("state=backoff"), "logs were:\n{}", output);
    assert!(output.contains("backoff_ms=100"), "logs were:\n{}", output);
    assert!(output.contains("last_error=\"server_error\""), "logs were:\n{}", output);
}
