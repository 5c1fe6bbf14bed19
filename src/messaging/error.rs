//! Messaging error taxonomy
//!
//! Errors are `Clone` so that a single initialization outcome can be handed
//! to every caller waiting on the same in-flight attempt.

use std::time::Duration;

use super::state::ConnectionPhase;

/// Errors surfaced by the messaging connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Operation attempted outside CONNECTED
    NotReady { phase: ConnectionPhase },
    /// Breaker is open; retry after the remaining cooldown
    CircuitOpen { retry_after: Duration },
    /// Breaker is half-open and every probe slot is taken
    CircuitBusy,
    /// Waited too long for the initialization lock
    LockTimeout { waited: Duration },
    /// Lock was force-released while waiting, or teardown interrupted
    /// an in-flight bootstrap
    LockCancelled,
    /// Bootstrap exceeded the initialization window
    InitTimeout { after: Duration },
    AuthFailure(String),
    /// Transport dropped mid-operation
    SessionLost(String),
    Transport(String),
    Storage(String),
}

/// Coarse classification used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Contention,
    Capacity,
    Bootstrap,
    Runtime,
}

impl MessagingError {
    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotReady { .. } => "not_ready",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::CircuitBusy => "circuit_busy",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockCancelled => "lock_cancelled",
            Self::InitTimeout { .. } => "init_timeout",
            Self::AuthFailure(_) => "auth_failure",
            Self::SessionLost(_) => "session_lost",
            Self::Transport(_) => "transport",
            Self::Storage(_) => "storage",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::LockTimeout { .. } | Self::LockCancelled | Self::NotReady { .. } => {
                ErrorClass::Contention
            }
            Self::CircuitOpen { .. } | Self::CircuitBusy => ErrorClass::Capacity,
            Self::InitTimeout { .. } | Self::AuthFailure(_) | Self::Transport(_) => {
                ErrorClass::Bootstrap
            }
            Self::SessionLost(_) | Self::Storage(_) => ErrorClass::Runtime,
        }
    }

    /// Transient errors: the caller should retry later rather than escalate
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Contention | ErrorClass::Capacity)
    }

    /// Retry-after hint, only meaningful for an open circuit
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

impl std::fmt::Display for MessagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady { phase } => write!(f, "messaging client not ready (phase {})", phase),
            Self::CircuitOpen { retry_after } => write!(
                f,
                "circuit open, retry after {}ms",
                retry_after.as_millis()
            ),
            Self::CircuitBusy => write!(f, "circuit half-open, probe limit reached"),
            Self::LockTimeout { waited } => write!(
                f,
                "timed out after {}ms waiting for initialization lock",
                waited.as_millis()
            ),
            Self::LockCancelled => write!(f, "initialization cancelled by teardown"),
            Self::InitTimeout { after } => write!(
                f,
                "initialization did not complete within {}ms",
                after.as_millis()
            ),
            Self::AuthFailure(msg) => write!(f, "authentication failed: {}", msg),
            Self::SessionLost(msg) => write!(f, "session lost: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for MessagingError {}
