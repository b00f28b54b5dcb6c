//! Aborting a run: records stop being pulled, suspended work unwinds and
//! the summary still accounts for every pulled record.

mod common;

use common::{ok_payloads, CountingSource, ScriptedTransport};
use fanout::{
    AdmissionConfig, BatchConfig, CancellationToken, DispatchConfig, Engine, RetryConfig,
    TerminalOutcome, VecSource,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn config(cap: usize) -> DispatchConfig {
    DispatchConfig::new(AdmissionConfig::per_second(cap, 10_000, 10_000))
}

fn cancel_after(cancel: CancellationToken, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        cancel.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run() {
    let transport = ScriptedTransport::ok(Duration::from_secs(1));
    let engine = Engine::new(config(5), transport.clone()).unwrap();
    let (source, pulled) = CountingSource::new(VecSource::from_payloads(ok_payloads(100)));

    cancel_after(engine.cancellation_token(), Duration::from_millis(2_500));
    let summary = engine.run(source).await;

    assert!(summary.run_cancelled);
    assert!(summary.is_balanced());
    // Two full waves of five finished before the abort
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.total, pulled.load(Ordering::SeqCst));
    assert_eq!(summary.cancelled, summary.total - 10);
    assert!(summary.total < 100);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_pulls_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let transport = ScriptedTransport::ok(Duration::from_millis(1));
    let engine = Engine::new(config(4), transport.clone())
        .unwrap()
        .with_cancellation(cancel);
    let (source, pulled) = CountingSource::new(VecSource::from_payloads(ok_payloads(10)));

    let summary = engine.run(source).await;

    assert!(summary.run_cancelled);
    assert_eq!(summary.total, 0);
    assert_eq!(pulled.load(Ordering::SeqCst), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_backoff() {
    let transport = ScriptedTransport::by_payload(Duration::from_millis(1));
    let config = config(4).with_retry(
        RetryConfig::new(5)
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(false),
    );
    let engine = Engine::new(config, transport.clone())
        .unwrap()
        .with_record_retention(true);

    cancel_after(engine.cancellation_token(), Duration::from_secs(1));
    let started = tokio::time::Instant::now();
    let summary = engine
        .run(VecSource::from_payloads(vec!["throttled"; 3]))
        .await;

    // The run ends at the abort, not after the 20s backoff
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.cancelled, 3);
    assert_eq!(transport.calls(), 3);
    for record in &summary.records {
        assert_eq!(record.outcome, TerminalOutcome::Cancelled { attempts: 1 });
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_behaves_like_abort() {
    let transport = ScriptedTransport::ok(Duration::from_millis(400));
    let engine = Engine::new(config(2).with_deadline(Duration::from_secs(1)), transport).unwrap();

    let summary = engine.run(VecSource::from_payloads(ok_payloads(50))).await;

    assert!(summary.run_cancelled);
    assert!(summary.is_balanced());
    assert_eq!(summary.succeeded, 4);
    assert!(summary.cancelled > 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reports_buffered_records() {
    let transport = ScriptedTransport::ok(Duration::from_secs(1));
    let config = config(2).with_batching(
        BatchConfig::new(2, Duration::from_millis(10)).with_buffer_capacity(6),
    );
    let engine = Engine::new(config, transport.clone()).unwrap();
    let (source, pulled) = CountingSource::new(VecSource::from_payloads(ok_payloads(100)));

    cancel_after(engine.cancellation_token(), Duration::from_millis(1_500));
    let summary = engine.run(source).await;

    assert!(summary.run_cancelled);
    assert!(summary.is_balanced());
    assert_eq!(summary.total, pulled.load(Ordering::SeqCst));
    assert!(summary.cancelled > 0);
    assert!(summary.total <= 8 + summary.succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_applies_per_run() {
    let cancel = CancellationToken::new();
    let transport = ScriptedTransport::ok(Duration::from_secs(3));
    let engine = Engine::new(config(1).with_deadline(Duration::from_secs(5)), transport)
        .unwrap()
        .with_cancellation(cancel.clone());

    let first = engine.run(VecSource::from_payloads(ok_payloads(5))).await;
    let second = engine.run(VecSource::from_payloads(ok_payloads(5))).await;

    // Each run gets its own budget; the engine's token stays live
    assert!(!cancel.is_cancelled());
    for summary in [&first, &second] {
        assert!(summary.run_cancelled);
        assert_eq!(summary.succeeded, 1);
        assert!(summary.is_balanced());
    }
}
