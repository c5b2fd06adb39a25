//! Feed Circuit Breaker
//!
//! Pauses a feed after repeated cycle failures so a broken oracle or RPC
//! endpoint is not hammered every tick. After the recovery timeout one probe
//! cycle is let through; its outcome closes or re-opens the circuit.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - cycles run every tick
    Closed,
    /// Failure threshold exceeded - ticks are skipped
    Open,
    /// Recovery period - a single probe cycle is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedCircuitBreakerConfig {
    /// Consecutive failed cycles that trip the circuit (0 disables it)
    pub failure_threshold: u32,
    /// Time to wait before transitioning from Open to HalfOpen (seconds)
    pub recovery_timeout_secs: u64,
}

impl Default for FeedCircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
        }
    }
}

impl From<&crate::config::SchedulerConfig> for FeedCircuitBreakerConfig {
    fn from(cfg: &crate::config::SchedulerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            recovery_timeout_secs: cfg.recovery_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripReason {
    ConsecutiveFailures(u32),
    FailedProbe(String),
    ManualTrip(String),
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveFailures(n) => write!(f, "{} consecutive failures", n),
            TripReason::FailedProbe(reason) => write!(f, "recovery probe failed: {}", reason),
            TripReason::ManualTrip(reason) => write!(f, "manual: {}", reason),
        }
    }
}

/// Circuit breaker guarding one feed's cycles
pub struct FeedCircuitBreaker {
    feed: String,
    config: FeedCircuitBreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    last_failure: RwLock<Option<DateTime<Utc>>>,
    last_trip_reason: RwLock<Option<TripReason>>,
    total_trips: AtomicU64,
}

impl FeedCircuitBreaker {
    pub fn new(feed: impl Into<String>, config: FeedCircuitBreakerConfig) -> Self {
        Self {
            feed: feed.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            last_failure: RwLock::new(None),
            last_trip_reason: RwLock::new(None),
            total_trips: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Whether a cycle may start now
    ///
    /// Moves Open to HalfOpen once the recovery timeout has elapsed; in
    /// HalfOpen only the first caller gets through until an outcome is
    /// recorded.
    pub async fn should_allow(&self) -> bool {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let recovered = self
                    .opened_at
                    .read()
                    .await
                    .map(|at| at.elapsed() >= self.recovery_timeout())
                    .unwrap_or(true);
                if recovered {
                    *state = CircuitState::HalfOpen;
                    info!(feed = %self.feed, "Circuit breaker transitioning to HALF-OPEN");
                }
                recovered
            }
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state().await != CircuitState::Closed {
            self.close().await;
        }
        debug!(feed = %self.feed, "Cycle success recorded");
    }

    pub async fn record_failure(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure.write().await = Some(Utc::now());

        warn!(feed = %self.feed, failures, reason, "Cycle failure recorded");

        if self.state().await == CircuitState::HalfOpen {
            self.trip(TripReason::FailedProbe(reason.to_string())).await;
        } else if self.config.failure_threshold > 0 && failures >= self.config.failure_threshold
        {
            self.trip(TripReason::ConsecutiveFailures(failures)).await;
        }
    }

    pub async fn trip(&self, reason: TripReason) {
        let mut state = self.state.write().await;
        if *state != CircuitState::Open {
            *state = CircuitState::Open;
            *self.opened_at.write().await = Some(Instant::now());
            *self.last_trip_reason.write().await = Some(reason.clone());
            self.total_trips.fetch_add(1, Ordering::SeqCst);

            warn!(feed = %self.feed, %reason, "Circuit breaker TRIPPED");
        }
    }

    /// Close the circuit (resume normal operation)
    pub async fn close(&self) {
        *self.state.write().await = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
        info!(feed = %self.feed, "Circuit breaker CLOSED - normal operation resumed");
    }

    /// Seconds left before a probe is allowed
    pub async fn time_until_recovery(&self) -> u64 {
        match *self.opened_at.read().await {
            Some(at) => self
                .recovery_timeout()
                .saturating_sub(at.elapsed())
                .as_secs(),
            None => 0,
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.recovery_timeout_secs)
    }

    pub async fn get_stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state().await,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_failure: *self.last_failure.read().await,
            last_trip_reason: self.last_trip_reason.read().await.clone(),
            total_trips: self.total_trips.load(Ordering::SeqCst),
        }
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_trip_reason: Option<TripReason>,
    pub total_trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: u64) -> FeedCircuitBreaker {
        FeedCircuitBreaker::new(
            "test",
            FeedCircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_secs: recovery,
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = breaker(3, 60);
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.should_allow().await);
    }

    #[tokio::test]
    async fn test_circuit_breaker_trip_on_failures() {
        let cb = breaker(3, 60);

        cb.record_failure("error 1").await;
        cb.record_failure("error 2").await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure("error 3").await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.should_allow().await);
        assert_eq!(cb.get_stats().await.total_trips, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 60);

        cb.record_failure("error 1").await;
        cb.record_failure("error 2").await;
        cb.record_success().await;

        cb.record_failure("error 1").await;
        cb.record_failure("error 2").await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_zero_threshold_never_trips() {
        let cb = breaker(0, 60);
        for _ in 0..10 {
            cb.record_failure("boom").await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe() {
        let cb = breaker(1, 30);
        cb.record_failure("boom").await;
        assert!(!cb.should_allow().await);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cb.should_allow().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        // Second caller waits for the probe outcome
        assert!(!cb.should_allow().await);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(1, 30);
        cb.record_failure("boom").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.should_allow().await);

        cb.record_failure("still broken").await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.time_until_recovery().await, 30);
        assert!(matches!(
            cb.get_stats().await.last_trip_reason,
            Some(TripReason::FailedProbe(_))
        ));
    }
}
