// Generic circuit breaker for fallible async calls to external dependencies
//
// Wraps any operation that can fail repeatedly (RPC endpoints, HTTP APIs)
// and stops calling it for a cooldown period after `fail_threshold`
// consecutive failures. The OPEN -> HALF_OPEN transition is lazy: it is
// observed on the next call after the cooldown elapses, not on a timer.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Circuit breaker '{label}' is open, failing fast")]
pub struct CircuitOpenError {
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub fail_threshold: u32,
    /// Cooldown before a half-open probe is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Resilience wrapper around one labeled dependency.
///
/// Owns its state exclusively; nothing is persisted. A fallback producer
/// may be configured, in which case fail-fast and operation failures
/// return the fallback value instead of an error.
pub struct CircuitBreaker<T> {
    label: String,
    config: CircuitBreakerConfig,
    fallback: Option<Arc<dyn Fn() -> T + Send + Sync>>,
    inner: Mutex<BreakerInner>,
}

impl<T> CircuitBreaker<T> {
    pub fn new(label: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            label: label.to_string(),
            config,
            fallback: None,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Force the circuit closed with the failure counter zeroed.
    /// Operator recovery hook.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        log::info!("[CircuitBreaker {}] Manually reset to CLOSED", self.label);
    }

    /// Run `operation` through the breaker.
    ///
    /// While OPEN the operation is not invoked at all; the call fails
    /// fast (or yields the fallback). Any success forces CLOSED and
    /// zeroes the failure counter, including a half-open probe.
    pub async fn call<F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == CircuitState::Open {
                let cooled_down = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    log::info!(
                        "[CircuitBreaker {}] Cooldown elapsed, transitioning OPEN -> HALF_OPEN (probe)",
                        self.label
                    );
                } else {
                    log::warn!(
                        "[CircuitBreaker {}] OPEN, failing fast without calling operation",
                        self.label
                    );
                    if let Some(fallback) = &self.fallback {
                        return Ok(fallback());
                    }
                    return Err(CircuitOpenError {
                        label: self.label.clone(),
                    }
                    .into());
                }
            }
        }

        match operation().await {
            Ok(value) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state != CircuitState::Closed {
                    log::info!(
                        "[CircuitBreaker {}] Call succeeded, transitioning {:?} -> CLOSED",
                        self.label,
                        inner.state
                    );
                }
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                Ok(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock().unwrap();
                inner.consecutive_failures += 1;
                inner.last_failure = Some(Instant::now());

                let tripped = inner.state == CircuitState::HalfOpen
                    || inner.consecutive_failures >= self.config.fail_threshold;
                if tripped && inner.state != CircuitState::Open {
                    log::warn!(
                        "[CircuitBreaker {}] {} consecutive failures, opening circuit for {:?}",
                        self.label,
                        inner.consecutive_failures,
                        self.config.reset_timeout
                    );
                    inner.state = CircuitState::Open;
                }
                drop(inner);

                if let Some(fallback) = &self.fallback {
                    log::warn!(
                        "[CircuitBreaker {}] Operation failed, returning fallback: {}",
                        self.label,
                        e
                    );
                    return Ok(fallback());
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            fail_threshold: 3,
            reset_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_closed_passes_through() {
        let breaker: CircuitBreaker<i32> = CircuitBreaker::new("test", fast_config());
        let result = breaker.call(|| async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker: CircuitBreaker<i32> = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_fails_fast_without_invoking() {
        let breaker: CircuitBreaker<i32> = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err(anyhow!("boom")) }).await;
        }

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .call(|| {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;
        assert!(result.is_err());
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        assert!(result
            .unwrap_err()
            .downcast_ref::<CircuitOpenError>()
            .is_some());
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let breaker: CircuitBreaker<i32> = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = breaker.call(|| async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Counter was reset: two fresh failures do not reopen
        let _ = breaker.call(|| async { Err(anyhow!("x")) }).await;
        let _ = breaker.call(|| async { Err(anyhow!("x")) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let breaker: CircuitBreaker<i32> = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err(anyhow!("boom")) }).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker.call(|| async { Err(anyhow!("probe failed")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // A new cooldown window started: still failing fast right away
        let result = breaker.call(|| async { Ok(1) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fallback_on_open_and_on_failure() {
        let breaker = CircuitBreaker::new("test", fast_config()).with_fallback(|| -1);

        // Operation failure returns the fallback, not the error
        let result = breaker
            .call(|| async { Err(anyhow!("boom")) })
            .await
            .unwrap();
        assert_eq!(result, -1);

        for _ in 0..3 {
            let _ = breaker.call(|| async { Err(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fail-fast path also returns the fallback
        let result = breaker.call(|| async { Ok(5) }).await.unwrap();
        assert_eq!(result, -1);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker: CircuitBreaker<i32> = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let result = breaker.call(|| async { Ok(9) }).await.unwrap();
        assert_eq!(result, 9);
    }
}
