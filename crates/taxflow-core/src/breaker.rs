//! Circuit breaker for rate-limited upstreams.
//!
//! Transitions: `Closed → Open` after `failure_threshold` rate-limit/timeout
//! failures inside `window`; `Open → HalfOpen` once `cooldown` elapses;
//! `HalfOpen → Closed` on a successful probe, `HalfOpen → Open` on a failed one.
//! While open, calls fail fast with `UpstreamError::CircuitOpen`.

use crate::config::BreakerConfig;
use crate::error::UpstreamError;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    failures: VecDeque<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            window,
            cooldown,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                failures: VecDeque::new(),
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &BreakerConfig) -> Self {
        Self::new(
            name,
            cfg.failure_threshold,
            Duration::from_secs(cfg.window_secs),
            Duration::from_secs(cfg.cooldown_secs),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { until } if Instant::now() >= until => BreakerState::HalfOpen,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Admit or reject a call. Moves `Open → HalfOpen` once the cooldown has
    /// passed and admits exactly one probe while half-open.
    pub fn try_acquire(&self) -> Result<(), UpstreamError> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Closed => Ok(()),
            Phase::Open { until } => {
                if Instant::now() >= until {
                    tracing::info!(breaker = %self.name, "cooldown elapsed, probing upstream");
                    inner.phase = Phase::HalfOpen { probing: true };
                    Ok(())
                } else {
                    Err(UpstreamError::CircuitOpen(self.name.clone()))
                }
            }
            Phase::HalfOpen { probing: true } => Err(UpstreamError::CircuitOpen(self.name.clone())),
            Phase::HalfOpen { probing: false } => {
                inner.phase = Phase::HalfOpen { probing: true };
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(inner.phase, Phase::HalfOpen { .. }) {
            tracing::info!(breaker = %self.name, "probe succeeded, circuit closed");
        }
        inner.phase = Phase::Closed;
        inner.failures.clear();
    }

    pub fn record_failure(&self, err: &UpstreamError) {
        let mut inner = self.lock();
        let now = Instant::now();

        if !err.trips_breaker() {
            // A non-throttling failure still proves the upstream is reachable.
            if matches!(inner.phase, Phase::HalfOpen { .. }) {
                inner.phase = Phase::Closed;
                inner.failures.clear();
            }
            return;
        }

        if matches!(inner.phase, Phase::HalfOpen { .. }) {
            tracing::warn!(breaker = %self.name, error = %err, "probe failed, circuit reopened");
            inner.phase = Phase::Open {
                until: now + self.cooldown,
            };
            return;
        }

        inner.failures.push_back(now);
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > self.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        if matches!(inner.phase, Phase::Closed) && inner.failures.len() as u32 >= self.threshold {
            tracing::warn!(
                breaker = %self.name,
                failures = inner.failures.len(),
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
            inner.phase = Phase::Open {
                until: now + self.cooldown,
            };
            inner.failures.clear();
        }
    }

    /// An admitted call ended without an answer: its future was dropped or
    /// unwound. A half-open circuit reopens so the next caller after the
    /// cooldown is admitted; a closed one is left alone.
    fn abandon(&self) {
        let mut inner = self.lock();
        if matches!(inner.phase, Phase::HalfOpen { probing: true }) {
            tracing::warn!(breaker = %self.name, "half-open call abandoned, circuit reopened");
            inner.phase = Phase::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }

    /// Run one external call under admission control and a timeout.
    ///
    /// A timeout is reported as `UpstreamError::Timeout` and counted exactly
    /// like a rate-limit failure.
    pub async fn call<T, Fut>(&self, timeout: Duration, fut: Fut) -> Result<T, UpstreamError>
    where
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.try_acquire()?;
        let mut admitted = Admitted {
            breaker: self,
            answered: false,
        };
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(UpstreamError::Timeout(timeout.as_millis() as u64)),
        };
        admitted.answered = true;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }
}

/// Lives for the duration of one admitted call.
struct Admitted<'a> {
    breaker: &'a CircuitBreaker,
    answered: bool,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.breaker.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "rpc",
            3,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    fn limited() -> UpstreamError {
        UpstreamError::RateLimited("429".into())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let b = breaker();
        for _ in 0..2 {
            b.record_failure(&limited());
        }
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure(&limited());
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(UpstreamError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let b = breaker();
        b.record_failure(&limited());
        b.record_failure(&limited());
        tokio::time::advance(Duration::from_secs(61)).await;
        b.record_failure(&limited());
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn non_rate_limit_errors_do_not_trip() {
        let b = breaker();
        for _ in 0..10 {
            b.record_failure(&UpstreamError::Rejected("bad request".into()));
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe_then_closes() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(&limited());
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.try_acquire().unwrap();
        // Second caller while the probe is outstanding fails fast.
        assert!(b.try_acquire().is_err());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        b.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(&limited());
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        b.try_acquire().unwrap();
        b.record_failure(&UpstreamError::Timeout(10));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_counts_as_failure() {
        let b = CircuitBreaker::new("slow", 1, Duration::from_secs(60), Duration::from_secs(30));
        let err = b
            .call(Duration::from_millis(100), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, UpstreamError>(1)
            })
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::Timeout(100));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn call_fails_fast_while_open() {
        let b = CircuitBreaker::new("rpc", 1, Duration::from_secs(60), Duration::from_secs(30));
        b.record_failure(&limited());
        let mut invoked = false;
        let err = b
            .call(Duration::from_secs(1), async {
                invoked = true;
                Ok::<_, UpstreamError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::CircuitOpen(_)));
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_half_open_call_reopens_circuit() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(&limited());
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let slow = b.call(Duration::from_secs(60), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, UpstreamError>(())
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        b.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_while_closed_is_not_a_failure() {
        let b = CircuitBreaker::new("rpc", 1, Duration::from_secs(60), Duration::from_secs(30));
        let slow = b.call(Duration::from_secs(60), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, UpstreamError>(())
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
