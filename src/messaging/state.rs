//! Connection lifecycle state machine
//!
//! All phase changes go through [`next_phase`]; illegal (phase, event) pairs
//! are rejected and logged instead of silently applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use super::error::MessagingError;
use super::events::{EventBus, MessagingEvent};

// ============================================================================
// Phases and events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionPhase {
    Disconnected,
    Initializing,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Inputs that drive the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    InitializeRequested,
    TransportReady,
    PairingTimedOut,
    AuthFailed,
    BootstrapFailed,
    TransportDisconnected,
    Teardown,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InitializeRequested => "initialize_requested",
            Self::TransportReady => "transport_ready",
            Self::PairingTimedOut => "pairing_timed_out",
            Self::AuthFailed => "auth_failed",
            Self::BootstrapFailed => "bootstrap_failed",
            Self::TransportDisconnected => "transport_disconnected",
            Self::Teardown => "teardown",
        };
        write!(f, "{}", name)
    }
}

/// Result of a legal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: ConnectionPhase,
    pub event: SessionEvent,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal transition: {} on {}", self.event, self.from)
    }
}

impl std::error::Error for IllegalTransition {}

/// The transition table
pub fn next_phase(
    from: ConnectionPhase,
    event: SessionEvent,
) -> Result<Transition, IllegalTransition> {
    use ConnectionPhase::*;
    use SessionEvent::*;

    let to = match (from, event) {
        (_, Teardown) => Disconnected,

        (Disconnected | Error, InitializeRequested) => Initializing,
        // A stale half-paired session is replaced by a new bootstrap
        (Initializing, InitializeRequested) => Initializing,

        (Initializing | Connected, TransportReady) => Connected,
        (Initializing, PairingTimedOut) => Initializing,
        (Initializing, AuthFailed | BootstrapFailed | TransportDisconnected) => Error,

        (Connected, TransportDisconnected) => Disconnected,
        (Connected, AuthFailed) => Error,

        (Disconnected | Error, TransportDisconnected) => from,

        _ => return Err(IllegalTransition { from, event }),
    };

    Ok(Transition { from, to })
}

// ============================================================================
// Owned state
// ============================================================================

/// Last error attached to the connection
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Lifecycle snapshot. The attached transport session lives in the
/// supervisor next to this state.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub reconnect_attempts: u32,
    pub last_error: Option<ErrorRecord>,
    pub manual_disconnect_requested: bool,
    pub destroy_in_progress: bool,
    pub connected_since: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            manual_disconnect_requested: false,
            destroy_in_progress: false,
            connected_since: None,
        }
    }
}

pub struct ConnectionStateMachine {
    state: Mutex<ConnectionState>,
    events: Arc<EventBus>,
}

impl ConnectionStateMachine {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(ConnectionState::default()),
            events,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Apply an event. Only genuine phase changes are broadcast.
    pub fn apply(
        &self,
        event: SessionEvent,
        reason: &str,
    ) -> Result<Transition, IllegalTransition> {
        let transition = {
            let mut state = self.state.lock();
            let transition = match next_phase(state.phase, event) {
                Ok(t) => t,
                Err(illegal) => {
                    error!(from = %illegal.from, event = %illegal.event, reason, "illegal_session_transition");
                    return Err(illegal);
                }
            };

            if transition.changed() {
                state.phase = transition.to;
                if transition.to == ConnectionPhase::Connected {
                    state.reconnect_attempts = 0;
                    state.connected_since = Some(Utc::now());
                } else {
                    state.connected_since = None;
                }
            }
            transition
        };

        if transition.changed() {
            info!(
                from = %transition.from,
                to = %transition.to,
                event = %event,
                reason,
                "session_transition"
            );
            self.events.publish(MessagingEvent::StateChanged {
                from: transition.from,
                to: transition.to,
                reason: reason.to_string(),
            });
        }

        Ok(transition)
    }

    /// Attach an error to the connection and broadcast it
    pub fn record_error(&self, err: &MessagingError) {
        let record = ErrorRecord {
            kind: err.kind().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        };
        self.state.lock().last_error = Some(record.clone());
        self.events.publish(MessagingEvent::ErrorRecorded {
            kind: record.kind,
            message: record.message,
        });
    }

    pub fn increment_attempts(&self) -> u32 {
        let mut state = self.state.lock();
        state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
        state.reconnect_attempts
    }

    pub fn reset_attempts(&self) {
        self.state.lock().reconnect_attempts = 0;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    pub fn set_manual_disconnect(&self, requested: bool) {
        self.state.lock().manual_disconnect_requested = requested;
    }

    pub fn manual_disconnect_requested(&self) -> bool {
        self.state.lock().manual_disconnect_requested
    }

    /// Returns false if a destroy is already running
    pub fn begin_destroy(&self) -> bool {
        let mut state = self.state.lock();
        if state.destroy_in_progress {
            return false;
        }
        state.destroy_in_progress = true;
        true
    }

    pub fn end_destroy(&self) {
        self.state.lock().destroy_in_progress = false;
    }
}
