//! Circuit breaker
//!
//! Generic failure isolation around any async operation:
//! - CLOSED counts failures (successes decay the count by one)
//! - OPEN fails fast until the cooldown since the last failure elapses
//! - HALF_OPEN admits a bounded number of probes; one success closes,
//!   one failure reopens
//! - `trip` latches OPEN past the cooldown until `reset`

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CircuitBreakerConfig;
use super::error::{ErrorClass, MessagingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time breaker snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub time_in_state_ms: u64,
    /// Only set while OPEN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub probes_in_flight: u32,
    /// Held OPEN until an operator reset
    pub latched: bool,
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitPhase,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    entered_at: Instant,
    probes_in_flight: u32,
    latched: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            last_failure_at: None,
            entered_at: Instant::now(),
            probes_in_flight: 0,
            latched: false,
        }
    }

    fn enter(&mut self, phase: CircuitPhase) {
        self.phase = phase;
        self.entered_at = Instant::now();
        if phase != CircuitPhase::HalfOpen {
            self.probes_in_flight = 0;
        }
    }

    fn remaining_cooldown(&self, cooldown: Duration) -> Duration {
        match self.last_failure_at {
            Some(at) => cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Failure-isolation wrapper shared by one class of operations
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

/// Decrements the half-open probe count even if the operation is dropped
struct ProbeSlot {
    state: Arc<Mutex<BreakerState>>,
    active: bool,
}

impl ProbeSlot {
    fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            let mut state = self.state.lock();
            state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
        }
    }
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(BreakerState::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejections (`CircuitOpen`, `CircuitBusy`) never invoke the operation
    /// and are not counted as failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, MessagingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let slot = self.admit()?;
        let result = operation().await;
        slot.finish();

        match &result {
            Ok(_) => self.record_success(),
            // Cancellation says nothing about the health of the dependency
            Err(e) if e.class() == ErrorClass::Contention => {}
            Err(e) => self.record_failure(e.kind()),
        }
        result
    }

    fn admit(&self) -> Result<ProbeSlot, MessagingError> {
        let mut state = self.state.lock();

        if state.latched {
            return Err(MessagingError::CircuitOpen {
                retry_after: self.config.cooldown,
            });
        }

        if state.phase == CircuitPhase::Open {
            let remaining = state.remaining_cooldown(self.config.cooldown);
            if !remaining.is_zero() {
                return Err(MessagingError::CircuitOpen {
                    retry_after: remaining,
                });
            }
            state.enter(CircuitPhase::HalfOpen);
            debug!(breaker = %self.name, "circuit_half_open");
        }

        if state.phase == CircuitPhase::HalfOpen {
            if state.probes_in_flight >= self.config.half_open_max_probes {
                return Err(MessagingError::CircuitBusy);
            }
            state.probes_in_flight += 1;
            return Ok(ProbeSlot {
                state: Arc::clone(&self.state),
                active: true,
            });
        }

        Ok(ProbeSlot {
            state: Arc::clone(&self.state),
            active: false,
        })
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::HalfOpen => {
                state.failure_count = 0;
                state.enter(CircuitPhase::Closed);
                info!(breaker = %self.name, "circuit_closed");
            }
            CircuitPhase::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            // A late success from a call admitted before the trip.
            CircuitPhase::Open => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self, reason: &str) {
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Instant::now());

        match state.phase {
            CircuitPhase::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    state.enter(CircuitPhase::Open);
                    warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        reason,
                        "circuit_opened"
                    );
                }
            }
            CircuitPhase::HalfOpen => {
                state.enter(CircuitPhase::Open);
                warn!(breaker = %self.name, reason, "circuit_reopened");
            }
            CircuitPhase::Open => {}
        }
    }

    /// Force the breaker into OPEN regardless of the failure count. It stays
    /// OPEN after the cooldown until `reset`.
    pub fn trip(&self, reason: &str) {
        let mut state = self.state.lock();
        state.last_failure_at = Some(Instant::now());
        state.latched = true;
        if state.phase != CircuitPhase::Open {
            state.enter(CircuitPhase::Open);
            warn!(breaker = %self.name, failures = state.failure_count, reason, "circuit_tripped");
        }
    }

    /// Manual operator recovery
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let was = state.phase;
        *state = BreakerState::new();
        if was != CircuitPhase::Closed {
            info!(breaker = %self.name, from = %was, "circuit_reset");
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    /// Pure read; does not move OPEN to HALF_OPEN
    pub fn status(&self) -> CircuitStatus {
        let state = self.state.lock();
        let retry_after_ms = (state.phase == CircuitPhase::Open)
            .then(|| state.remaining_cooldown(self.config.cooldown).as_millis() as u64);

        CircuitStatus {
            name: self.name.clone(),
            phase: state.phase,
            failure_count: state.failure_count,
            time_in_state_ms: state.entered_at.elapsed().as_millis() as u64,
            retry_after_ms,
            probes_in_flight: state.probes_in_flight,
            latched: state.latched,
        }
    }
}
