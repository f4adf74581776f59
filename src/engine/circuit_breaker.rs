// Circuit breaker guarding the ingestion queue

//! # Circuit Breaker
//!
//! Shared by every queue producer and consumer. When event processing keeps
//! failing, the breaker opens and submissions fail fast with
//! [`AutomationError::CircuitOpen`] instead of piling more work onto a
//! struggling downstream.
//!
//! ```text
//! ┌────────┐  failure_threshold  ┌──────┐  reset_timeout  ┌───────────┐
//! │ Closed │ ──────────────────▶ │ Open │ ──────────────▶ │ HalfOpen  │
//! └────────┘                     └──────┘                 └───────────┘
//!     ▲                              ▲     probe failed        │
//!     │                              └─────────────────────────┤
//!     └──────────────────── probe succeeded ───────────────────┘
//! ```
//!
//! Exactly one probe is let through in the half-open state.
//!
//! ## Rust Learning Notes:
//!
//! ### Lock-Free State
//! The state, failure counter and last-failure time are plain atomics.
//! Transitions use `compare_exchange` so two workers racing on the same
//! transition cannot both win it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{AutomationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time to wait in `Open` before letting a probe through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    /// Milliseconds since `epoch` of the most recent failure
    last_failure_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn take_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether a call may proceed right now
    ///
    /// Moves `Open` to `HalfOpen` once the reset timeout has passed and hands
    /// out the single half-open probe.
    pub fn allow_request(&self) -> bool {
        match self.current_state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.take_probe(),
        }
    }

    /// The state after applying the reset timeout
    ///
    /// An `Open` breaker whose reset timeout has passed moves to `HalfOpen`
    /// here. The probe is not taken.
    pub fn current_state(&self) -> CircuitState {
        let state = self.state();
        if state != CircuitState::Open {
            return state;
        }

        let since_failure = self
            .now_ms()
            .saturating_sub(self.last_failure_ms.load(Ordering::SeqCst));
        if since_failure < self.config.reset_timeout.as_millis() as u64 {
            return CircuitState::Open;
        }
        if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
            info!(breaker = %self.name, "Circuit half-open, allowing probe");
        }
        self.state()
    }

    /// `allow_request` as a `Result`
    pub fn check(&self) -> Result<()> {
        if self.allow_request() {
            Ok(())
        } else {
            Err(AutomationError::CircuitOpen(format!(
                "{} is open after {} failure(s)",
                self.name,
                self.failure_count()
            )))
        }
    }

    /// `false` once the reset timeout has passed, even before a probe ran
    pub fn is_open(&self) -> bool {
        self.current_state() == CircuitState::Open
    }

    pub fn record_success(&self) {
        let previous = self.state();
        self.failures.store(0, Ordering::SeqCst);
        self.state.store(CircuitState::Closed.as_u8(), Ordering::SeqCst);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        if previous != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_failure_ms.store(self.now_ms(), Ordering::SeqCst);

        match self.state() {
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    warn!(breaker = %self.name, "Probe failed, circuit re-opened");
                }
                self.probe_in_flight.store(false, Ordering::SeqCst);
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                if self.transition(CircuitState::Closed, CircuitState::Open) {
                    warn!(breaker = %self.name, failures, "Circuit opened");
                }
            }
            _ => {}
        }
    }

    /// Hand back a half-open probe whose outcome says nothing about health
    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    /// Force the breaker back to `Closed`
    pub fn reset(&self) {
        self.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert!(matches!(breaker.check(), Err(AutomationError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let breaker = breaker(Duration::from_millis(20));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe at a time
        assert!(!breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_half_open_probe_reopens_on_failure() {
        let breaker = breaker(Duration::from_millis(20));
        for _ in 0..3 {
            breaker.record_failure();
        }

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow_request());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_is_open_reports_half_open_after_reset_timeout() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(20),
            },
        );

        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(matches!(breaker.check(), Err(AutomationError::CircuitOpen(_))));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The probe is still available after the state check
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
