//! Outbound messaging connection manager
//!
//! One long-lived chat transport session, supervised through pairing,
//! readiness, disconnects and auth failures.

pub mod circuit_breaker;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod init_lock;
pub mod reconnect;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitPhase, CircuitStatus};
pub use config::{CircuitBreakerConfig, DeliveryConfig, MessagingConfig, ReconnectConfig};
pub use delivery::{AckOutcome, DeliveryRecord, DeliveryStatus, DeliveryTracker};
pub use error::{ErrorClass, MessagingError};
pub use events::{EventBus, MessagingEvent, ObserverHandle, PairingSession};
pub use init_lock::{InitLockGuard, InitializationLock};
pub use reconnect::{ReconnectScheduler, RetryDecision};
pub use state::{ConnectionPhase, ConnectionState, ConnectionStateMachine, SessionEvent};
pub use supervisor::{InitOutcome, OutboundMessage, SendResult, SessionSupervisor, SupervisorStatus};
pub use transport::{AuthConfig, Transport, TransportEvent, TransportHandle, TransportSession};
