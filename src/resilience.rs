//! Circuit breaker and retry policy for remote store calls.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Observable state of a [`CircuitBreaker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through.
    Closed,
    /// Calls are short-circuited until the cool-down ends.
    Open,
    /// Cool-down elapsed; one trial call at a time is let through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Stops calling a failing store for a cool-down period.
///
/// After `failure_threshold` consecutive failures the breaker opens and
/// every call returns `Error::CircuitOpen` without running. Once
/// `cool_down` has elapsed a single trial call is let through while the
/// rest keep short-circuiting; its success closes the breaker, its failure
/// re-opens it for another cool-down.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(5, Duration::from_secs(5))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        CircuitBreaker {
            failure_threshold: failure_threshold.max(1),
            cool_down,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(at) if at.elapsed() < self.cool_down => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }

    /// Run `call` unless the breaker is open.
    pub async fn call<T, Fut>(&self, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _trial = self.admit()?;

        let result = call.await;
        match &result {
            Ok(_) => self.record_success(),
            // Only store failures count; a data error says nothing about
            // the store's health.
            Err(e) if e.is_remote() => self.record_failure(),
            Err(_) => {}
        }
        result
    }

    /// Decide whether a call may run. In half-open state the admitted
    /// caller holds the trial slot until the returned guard drops.
    fn admit(&self) -> Result<Option<TrialGuard<'_>>> {
        let mut inner = self.lock();
        match inner.opened_at {
            None => Ok(None),
            Some(at) if at.elapsed() < self.cool_down => Err(Error::CircuitOpen),
            Some(_) if inner.trial_in_flight => Err(Error::CircuitOpen),
            Some(_) => {
                inner.trial_in_flight = true;
                debug!("Circuit breaker half-open, admitting trial call");
                Ok(Some(TrialGuard { breaker: self }))
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.opened_at.is_some() {
            info!("✓ Circuit breaker closed after successful trial call");
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trial_failed = inner.opened_at.is_some();
        if trial_failed || inner.consecutive_failures >= self.failure_threshold {
            if !trial_failed {
                warn!(
                    "⚠ Circuit breaker opened after {} consecutive failures (cool-down {:?})",
                    inner.consecutive_failures, self.cool_down
                );
            }
            inner.opened_at = Some(Instant::now());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // The critical sections never panic; recover the data if one did.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Frees the half-open trial slot, including when the trial is cancelled.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.breaker.lock().trial_in_flight = false;
    }
}

/// Retry with exponential backoff: `base_delay * 2^(attempt - 1)`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            retries,
            base_delay,
        }
    }

    /// Run `op` through `breaker`, retrying remote failures.
    ///
    /// Stops early when the breaker is open: further attempts could not
    /// reach the store anyway. The last error is returned once retries are
    /// exhausted.
    pub async fn run<T, F, Fut>(&self, breaker: &CircuitBreaker, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retries + 1; // +1 for initial attempt
        let mut attempts = 0;

        loop {
            attempts += 1;

            match breaker.call(op()).await {
                Ok(value) => return Ok(value),
                Err(Error::CircuitOpen) => return Err(Error::CircuitOpen),
                Err(e) if !e.is_remote() || attempts >= max_attempts => return Err(e),
                Err(e) => {
                    debug!(
                        "Remote operation failed (attempt {}/{}): {}, retrying...",
                        attempts, max_attempts, e
                    );
                    let delay = self.base_delay * 2_u32.saturating_pow(attempts - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn fail() -> Result<()> {
        Err(Error::BackendError("connection refused".to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(5));

        for _ in 0..4 {
            assert!(breaker.call(fail()).await.is_err());
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        assert!(breaker.call(fail()).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let result = breaker
            .call(async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(Error::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_trial() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        let _ = breaker.call(fail()).await;
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Failed trial re-opens immediately.
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        breaker.call(async { Ok(()) }).await.expect("trial succeeds");
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(5)));
        let _ = breaker.call(fail()).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let (release, gate) = tokio::sync::watch::channel(false);
        let ran = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let breaker = breaker.clone();
            let ran = ran.clone();
            let mut gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                breaker
                    .call(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        let _ = gate.wait_for(|open| *open).await;
                        Ok(())
                    })
                    .await
            }));
        }
        // Everyone but the trial is turned away without waiting.
        for _ in 0..100 {
            if tasks.iter().filter(|t| t.is_finished()).count() >= 9 {
                break;
            }
            tokio::task::yield_now().await;
        }
        release.send(true).expect("gate open");

        let mut rejected = 0;
        for task in tasks {
            if task.await.expect("task panicked") == Err(Error::CircuitOpen) {
                rejected += 1;
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(rejected, 9);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_slot() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        let _ = breaker.call(fail()).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let stalled = breaker.call(std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());

        breaker.call(async { Ok(()) }).await.expect("next trial admitted");
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_run() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
        let _ = breaker.call(fail()).await;
        let _ = breaker.call(fail()).await;
        breaker.call(async { Ok(()) }).await.expect("success");
        let _ = breaker.call(fail()).await;
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_data_errors_do_not_trip() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        let result: Result<()> = breaker
            .call(async { Err(Error::DeserializationError("bad".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let breaker = CircuitBreaker::default();
        let attempts = AtomicU32::new(0);

        let value = RetryPolicy::default()
            .run(&breaker, || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::BackendError("timeout".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_last_error() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(5));
        let attempts = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::new(2, Duration::from_millis(10))
            .run(&breaker, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::BackendError("down".into()))
            })
            .await;

        assert_eq!(result, Err(Error::BackendError("down".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_breaker_opens() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        let attempts = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::new(5, Duration::from_millis(10))
            .run(&breaker, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::BackendError("down".into()))
            })
            .await;

        assert_eq!(result, Err(Error::CircuitOpen));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
