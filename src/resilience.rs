/*!
 * @file resilience.rs
 * @brief Circuit breaker + retry/backoff wrapping the OLAP backend's HTTP calls (A6)
 *
 * Grounded on the base server's `circuit_breaker.rs` (Closed/Open/HalfOpen
 * state machine, `tokio::select!` timeout racing), adapted so the wrapped
 * operation is itself an async future — the base server's version accepted
 * a synchronous `FnOnce` closure even though it raced it against a sleep
 * future, so nothing inside the closure could actually suspend.
 */

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub sleep_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            sleep_window: Duration::from_secs(60),
        }
    }
}

struct State {
    kind: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_time: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<State>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(State {
                kind: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_time: None,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.kind
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let state = self.state.read().await;
            if state.kind == CircuitState::Open {
                let ready = state.next_attempt_time.map(|t| Instant::now() >= t).unwrap_or(true);
                if !ready {
                    return Err(RelayError::circuit_breaker_error(format!(
                        "circuit breaker '{}' is open",
                        self.name
                    )));
                }
            }
        }

        let result = tokio::select! {
            result = operation() => result,
            _ = sleep(self.config.timeout) => Err(RelayError::timeout_error(format!(
                "circuit breaker '{}' operation timed out", self.name
            ))),
        };

        self.record(result.is_ok()).await;
        result
    }

    async fn record(&self, success: bool) {
        let mut state = self.state.write().await;
        match state.kind {
            CircuitState::Closed => {
                if success {
                    state.failure_count = 0;
                } else {
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        state.kind = CircuitState::Open;
                        state.next_attempt_time = Some(Instant::now() + self.config.sleep_window);
                    }
                }
            }
            CircuitState::Open => {
                if Instant::now() >= state.next_attempt_time.unwrap_or_else(Instant::now) {
                    state.kind = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.failure_count = 0;
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        state.kind = CircuitState::Closed;
                        state.failure_count = 0;
                    }
                } else {
                    state.kind = CircuitState::Open;
                    state.next_attempt_time = Some(Instant::now() + self.config.sleep_window);
                }
            }
        }
    }
}

/// Whether an HTTP status is retryable (spec §4.9 Transport).
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 503)
}

/// Exponential backoff retry loop (base ≥ 100ms, factor 2) up to
/// `max_retries`, distinguishing retryable transport outcomes from
/// non-retryable ones before a transient failure ever reaches the breaker.
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = base_delay;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                timeout: Duration::from_secs(1),
                sleep_window: Duration::from_secs(60),
            },
        );
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(RelayError::internal_error("boom")) })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        let err = breaker.call(|| async { Ok::<_, RelayError>(()) }).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retry_gives_up_on_non_retryable_error() {
        let mut calls = 0;
        let result = retry_with_backoff(3, Duration::from_millis(1), || {
            calls += 1;
            async { Err::<(), _>(RelayError::bad_value("not retryable")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
