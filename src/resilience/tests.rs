use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;

fn options(max_retries: u32, threshold: u32, break_secs: u64) -> ResilienceOptions {
    ResilienceOptions {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: 0.0,
        failure_threshold: threshold,
        break_duration: Duration::from_secs(break_secs),
        health_window: Duration::from_secs(300),
    }
}

fn timeout_error() -> BoxError {
    Box::new(io::Error::new(io::ErrorKind::TimedOut, "timeout expired"))
}

fn fatal_error() -> BoxError {
    Box::new(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
}

#[test]
fn test_delay_exponential_and_capped() {
    let opts = ResilienceOptions {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(500),
        jitter: 0.0,
        ..Default::default()
    };
    assert_eq!(opts.delay_for_attempt(1), Duration::from_millis(100));
    assert_eq!(opts.delay_for_attempt(2), Duration::from_millis(200));
    assert_eq!(opts.delay_for_attempt(3), Duration::from_millis(400));
    assert_eq!(opts.delay_for_attempt(4), Duration::from_millis(500));
    assert_eq!(opts.delay_for_attempt(40), Duration::from_millis(500));
}

#[test]
fn test_jitter_bounds() {
    let opts = ResilienceOptions {
        base_delay: Duration::from_millis(1000),
        max_delay: Duration::from_secs(10),
        jitter: 0.25,
        ..Default::default()
    };
    let ms = opts.delay_for_attempt(1).as_millis() as f64;
    assert!(ms >= 750.0, "delay {} below jitter floor", ms);
    assert!(ms <= 1250.0, "delay {} above jitter ceiling", ms);
}

#[tokio::test]
async fn test_transient_failure_retried_to_success() {
    let policy = ResiliencePolicy::new(options(5, 100, 30));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let result = policy
        .execute("ping", &cancel, move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(timeout_error())
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_non_transient_surfaces_immediately() {
    let policy = ResiliencePolicy::new(options(5, 100, 30));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let result: Result<u32> = policy
        .execute("ping", &cancel, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(fatal_error())
            }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::Operation { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let policy = ResiliencePolicy::new(options(2, 100, 30));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let result: Result<u32> = policy
        .execute("ping", &cancel, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(timeout_error())
            }
        })
        .await;

    match result {
        Err(ResilienceError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected outcome: {:?}", other.err().map(|e| e.to_string())),
    }
    // Initial attempt + 2 retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancellation_stops_retry_loop() {
    let policy = ResiliencePolicy::new(options(10, 100, 30));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result: Result<u32> = policy
        .execute("ping", &cancel, || async { Err(timeout_error()) })
        .await;
    assert!(matches!(result, Err(ResilienceError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_half_opens_and_closes() {
    // No per-call retries so every failure counts once.
    let policy = ResiliencePolicy::new(options(0, 5, 30));
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let _: Result<u32> = policy
            .execute("ping", &cancel, || async { Err(timeout_error()) })
            .await;
    }

    // Breaker open: fails fast with a non-zero retry-after.
    let rejected: Result<u32> = policy.execute("ping", &cancel, || async { Ok(1) }).await;
    match rejected {
        Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected CircuitOpen, got {:?}", other.is_ok()),
    }

    // After the break elapses, one trial is admitted; success closes.
    tokio::time::advance(Duration::from_secs(31)).await;
    let trial: Result<u32> = policy.execute("ping", &cancel, || async { Ok(2) }).await;
    assert_eq!(trial.unwrap(), 2);

    let after: Result<u32> = policy.execute("ping", &cancel, || async { Ok(3) }).await;
    assert_eq!(after.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trial_failure_reopens() {
    let policy = ResiliencePolicy::new(options(0, 3, 30));
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let _: Result<u32> = policy
            .execute("flaky", &cancel, || async { Err(timeout_error()) })
            .await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    // Trial fails: breaker reopens.
    let _: Result<u32> = policy
        .execute("flaky", &cancel, || async { Err(timeout_error()) })
        .await;
    let rejected: Result<u32> = policy.execute("flaky", &cancel, || async { Ok(1) }).await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
}

#[tokio::test]
async fn test_health_recorded_per_operation() {
    let policy = ResiliencePolicy::new(options(0, 100, 30));
    let cancel = CancellationToken::new();

    let _ = policy
        .execute("alpha", &cancel, || async { Ok::<_, BoxError>(1u32) })
        .await;
    let _: Result<u32> = policy
        .execute("beta", &cancel, || async { Err(timeout_error()) })
        .await;

    let health = policy.health();
    assert_eq!(health.report("alpha").unwrap().successes, 1);
    let beta = health.report("beta").unwrap();
    assert_eq!(beta.failures, 1);
    assert!(beta.last_failure_reason.is_some());
}
