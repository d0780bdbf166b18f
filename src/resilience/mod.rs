//! Resilience layer: bounded retry with backoff and per-provider circuit
//! breakers.
//!
//! This module contains:
//! - classify: error kinds and the retry decision
//! - retry: backoff policy
//! - breaker: circuit breaker state machine
//! - Resilience: executor combining the three

pub mod breaker;
pub mod classify;
pub mod retry;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::ProviderError;

pub use breaker::{Admission, BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use classify::{classify, ErrorKind};
pub use retry::RetryPolicy;

/// Resilience configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the policy's retry budget
    pub max_retries: Option<u32>,

    /// Abandon the call (between attempts) once cancelled
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Successful call plus the number of attempts it took
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// Failure of a guarded call
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("Circuit open for '{key}', retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { key: String, retry_after: Duration },

    #[error("{kind} failure from '{key}' after {attempts} attempt(s): {source}")]
    Failed {
        key: String,
        kind: ErrorKind,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Call to '{key}' cancelled after {attempts} attempt(s)")]
    Cancelled { key: String, attempts: u32 },
}

impl CallError {
    /// Classified kind of the underlying provider failure
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CallError::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Retry-after hint for open circuits
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            CallError::CircuitOpen { .. } => 0,
            CallError::Failed { attempts, .. } | CallError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Counters for observability
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResilienceStats {
    /// Guarded calls started
    pub calls: u64,
    /// Individual attempts made
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    /// Successes that needed at least one retry
    pub recovered: u64,
    /// Calls refused by an open circuit
    pub short_circuited: u64,
}

/// Retry + circuit-breaker executor, one breaker per key
pub struct Resilience {
    config: ResilienceConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    stats: Mutex<ResilienceStats>,
}

impl Default for Resilience {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(ResilienceStats::default()),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Run `call` under the breaker for `key`, retrying retryable failures.
    ///
    /// Returns the last error when retries are exhausted, immediately for
    /// non-retryable kinds or when the failure opened the breaker, and
    /// `CircuitOpen` (without calling) when the breaker refuses an
    /// attempt.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        key: &str,
        options: CallOptions,
        mut call: F,
    ) -> Result<CallOutcome<T>, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_retries = options.max_retries.unwrap_or(self.config.retry.max_retries);
        let mut attempts: u32 = 0;

        self.stats.lock().await.calls += 1;

        loop {
            if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(CallError::Cancelled {
                    key: key.to_string(),
                    attempts,
                });
            }

            if let Admission::Rejected { retry_after } = self.admit(key).await {
                self.stats.lock().await.short_circuited += 1;
                debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, refusing call");
                return Err(CallError::CircuitOpen {
                    key: key.to_string(),
                    retry_after,
                });
            }

            attempts += 1;
            self.stats.lock().await.attempts += 1;

            match call().await {
                Ok(value) => {
                    self.record_success(key).await;
                    let mut stats = self.stats.lock().await;
                    stats.successes += 1;
                    if attempts > 1 {
                        stats.recovered += 1;
                        info!(key, attempts, "Call recovered after retry");
                    }
                    return Ok(CallOutcome { value, attempts });
                }
                Err(error) => {
                    let kind = classify(&error);
                    let circuit = self.record_failure(key).await;
                    self.stats.lock().await.failures += 1;

                    let retries_done = attempts - 1;
                    if !kind.is_retryable()
                        || circuit == BreakerState::Open
                        || !self.config.retry.should_retry(retries_done, max_retries)
                    {
                        warn!(key, attempts, %kind, ?circuit, error = %error, "Call failed permanently");
                        return Err(CallError::Failed {
                            key: key.to_string(),
                            kind,
                            attempts,
                            source: error,
                        });
                    }

                    let delay = self.config.retry.delay_for_retry(retries_done);
                    warn!(
                        key,
                        attempt = attempts,
                        %kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Call failed, retrying"
                    );
                    self.stats.lock().await.retries += 1;

                    match &options.cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    return Err(CallError::Cancelled {
                                        key: key.to_string(),
                                        attempts,
                                    });
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }

    async fn admit(&self, key: &str) -> Admission {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.breaker.clone()));
        let admission = breaker.admit(Instant::now());
        if admission == Admission::Trial {
            info!(key, "Circuit half-open, admitting trial call");
        }
        admission
    }

    /// Record a success for `key` outside `execute_with_retry`
    pub async fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(key) {
            if breaker.state() != BreakerState::Closed {
                info!(key, "Circuit closed");
            }
            breaker.record_success();
        }
    }

    /// Record a failure for `key` outside `execute_with_retry` (e.g. a
    /// stream that broke after it was opened). Returns the new state.
    pub async fn record_failure(&self, key: &str) -> BreakerState {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.breaker.clone()));
        let before = breaker.state();
        breaker.record_failure(Instant::now());
        if before != BreakerState::Open && breaker.state() == BreakerState::Open {
            warn!(
                key,
                failures = breaker.consecutive_failures(),
                "Circuit opened"
            );
        }
        breaker.state()
    }

    /// Current breaker state for `key` (closed if never seen)
    pub async fn breaker_state(&self, key: &str) -> BreakerState {
        self.breakers
            .lock()
            .await
            .get(key)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot of every known breaker
    pub async fn breaker_snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        let now = Instant::now();
        self.breakers
            .lock()
            .await
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.snapshot(now)))
            .collect()
    }

    /// Manually close the breaker for `key`; returns false if unknown
    pub async fn reset_breaker(&self, key: &str) -> bool {
        match self.breakers.lock().await.get_mut(key) {
            Some(breaker) => {
                breaker.reset();
                info!(key, "Circuit manually reset");
                true
            }
            None => false,
        }
    }

    pub async fn stats(&self) -> ResilienceStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn resilience(threshold: u32) -> Resilience {
        Resilience::new(ResilienceConfig {
            breaker: BreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 60_000,
            },
            retry: RetryPolicy::default(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let res = resilience(5);
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = res
            .execute_with_retry("llm", CallOptions::default(), || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProviderError::new("connection reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, 2);

        let stats = res.stats().await;
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let res = resilience(5);
        let calls = Arc::new(AtomicU32::new(0));

        let err = res
            .execute_with_retry("llm", CallOptions::default(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProviderError::new("nope").with_status(401))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), Some(ErrorKind::Authentication));
        // Still counted by the breaker
        assert_eq!(res.breaker_snapshot().await["llm"].consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retry_loop() {
        let res = resilience(10);
        let token = CancellationToken::new();
        token.cancel();

        let err = res
            .execute_with_retry("llm", CallOptions::default().with_cancel(token), || async {
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Cancelled { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn test_reset_breaker() {
        let res = resilience(1);
        res.record_failure("llm").await;
        assert_eq!(res.breaker_state("llm").await, BreakerState::Open);

        assert!(res.reset_breaker("llm").await);
        assert_eq!(res.breaker_state("llm").await, BreakerState::Closed);
        assert!(!res.reset_breaker("unknown").await);
    }
}
