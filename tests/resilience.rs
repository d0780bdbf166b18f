//! Resilience Integration Tests
//!
//! Circuit breaker transitions and the retry budget as seen through
//! `Resilience::execute_with_retry`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit::adapters::ProviderError;
use conduit::resilience::{
    BreakerConfig, BreakerState, CallError, CallOptions, ErrorKind, Resilience, ResilienceConfig,
    RetryPolicy,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const RESET: Duration = Duration::from_secs(60);

fn resilience(threshold: u32) -> Resilience {
    Resilience::new(ResilienceConfig {
        breaker: BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: RESET.as_millis() as u64,
        },
        retry: RetryPolicy::default(),
    })
}

/// One non-retryable failure
async fn fail_once(r: &Resilience, key: &str, calls: &AtomicU32) -> Result<(), CallError> {
    r.execute_with_retry(key, CallOptions::default(), || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(ProviderError::new("nope").with_status(400))
    })
    .await
    .map(|o| o.value)
}

async fn succeed(r: &Resilience, key: &str, calls: &AtomicU32) -> Result<u32, CallError> {
    r.execute_with_retry(key, CallOptions::default(), || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    })
    .await
    .map(|o| o.value)
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_at_threshold() {
    let r = resilience(3);
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        assert!(matches!(
            fail_once(&r, "llm", &calls).await,
            Err(CallError::Failed { .. })
        ));
    }
    assert_eq!(r.breaker_state("llm").await, BreakerState::Open);

    // Refused without invoking the call
    let err = succeed(&r, "llm", &calls).await.unwrap_err();
    assert!(matches!(err, CallError::CircuitOpen { .. }));
    assert!(err.retry_after().unwrap() <= RESET);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Breakers are per key
    assert_eq!(succeed(&r, "other", &calls).await.unwrap(), 7);
    assert_eq!(r.stats().await.short_circuited, 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_trial_reopens_then_closes() {
    let r = resilience(2);
    let calls = AtomicU32::new(0);

    fail_once(&r, "llm", &calls).await.unwrap_err();
    fail_once(&r, "llm", &calls).await.unwrap_err();
    assert_eq!(r.breaker_state("llm").await, BreakerState::Open);

    tokio::time::advance(RESET + Duration::from_millis(1)).await;

    // Failed trial re-opens immediately
    fail_once(&r, "llm", &calls).await.unwrap_err();
    assert_eq!(r.breaker_state("llm").await, BreakerState::Open);
    assert!(matches!(
        succeed(&r, "llm", &calls).await,
        Err(CallError::CircuitOpen { .. })
    ));

    tokio::time::advance(RESET + Duration::from_millis(1)).await;

    // Successful trial closes
    assert_eq!(succeed(&r, "llm", &calls).await.unwrap(), 7);
    assert_eq!(r.breaker_state("llm").await, BreakerState::Closed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_only_one_trial_while_half_open() {
    let r = Arc::new(resilience(1));
    let calls = AtomicU32::new(0);

    fail_once(&r, "llm", &calls).await.unwrap_err();
    tokio::time::advance(RESET + Duration::from_millis(1)).await;

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let trial = {
        let r = r.clone();
        let entered = entered.clone();
        let release = release.clone();
        tokio::spawn(async move {
            r.execute_with_retry("llm", CallOptions::default(), || {
                let entered = entered.clone();
                let release = release.clone();
                async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok::<_, ProviderError>("trial")
                }
            })
            .await
        })
    };

    entered.notified().await;
    assert_eq!(r.breaker_state("llm").await, BreakerState::HalfOpen);

    let concurrent = succeed(&r, "llm", &calls).await;
    assert!(matches!(concurrent, Err(CallError::CircuitOpen { .. })));

    release.notify_one();
    let outcome = trial.await.unwrap().unwrap();
    assert_eq!(outcome.value, "trial");
    assert_eq!(r.breaker_state("llm").await, BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_returns_last_error() {
    let r = resilience(10);
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let err = r
        .execute_with_retry("llm", CallOptions::default().with_max_retries(2), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(ProviderError::new(format!("overloaded #{}", n)).with_status(503))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        CallError::Failed {
            kind,
            attempts,
            source,
            ..
        } => {
            assert_eq!(kind, ErrorKind::ServerError);
            assert_eq!(attempts, 3);
            assert_eq!(source.message, "overloaded #3");
        }
        other => panic!("unexpected error {:?}", other),
    }

    let stats = r.stats().await;
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opening_ends_retries_with_provider_error() {
    let r = resilience(1);
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let started = tokio::time::Instant::now();

    let err = r
        .execute_with_retry("llm", CallOptions::default().with_max_retries(3), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderError::new("upstream unavailable").with_status(503))
        })
        .await
        .unwrap_err();

    match err {
        CallError::Failed {
            kind,
            attempts,
            source,
            ..
        } => {
            assert_eq!(kind, ErrorKind::ServerError);
            assert_eq!(attempts, 1);
            assert_eq!(source.message, "upstream unavailable");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(r.breaker_state("llm").await, BreakerState::Open);

    let stats = r.stats().await;
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.short_circuited, 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failure() {
    let r = resilience(10);
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let outcome = r
        .execute_with_retry("llm", CallOptions::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::new("rate limit exceeded"))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

    assert_eq!(outcome.value, "done");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(r.stats().await.recovered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_backoff() {
    let r = Arc::new(resilience(10));
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let task = {
        let r = r.clone();
        let token = token.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            r.execute_with_retry("llm", CallOptions::default().with_cancel(token), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProviderError::new("socket hang up"))
                }
            })
            .await
        })
    };

    // First attempt fails, then the executor sleeps in backoff
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Cancelled { attempts: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reset_breaker() {
    let r = resilience(1);
    let calls = AtomicU32::new(0);

    assert!(!r.reset_breaker("llm").await);
    fail_once(&r, "llm", &calls).await.unwrap_err();
    assert_eq!(r.breaker_state("llm").await, BreakerState::Open);

    assert!(r.reset_breaker("llm").await);
    assert_eq!(succeed(&r, "llm", &calls).await.unwrap(), 7);
    assert!(r.breaker_snapshot().await.contains_key("llm"));
}
