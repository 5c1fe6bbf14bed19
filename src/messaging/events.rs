//! Typed broadcast of messaging events to UI observers
//!
//! Observers hold an [`ObserverHandle`]; the observer count drives whether
//! pairing codes are published at all.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use super::delivery::DeliveryStatus;
use super::state::ConnectionPhase;

/// Events fanned out to connected observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum MessagingEvent {
    #[serde(rename = "qr")]
    PairingCode {
        code: String,
        issued_at: DateTime<Utc>,
    },
    #[serde(rename = "ClientIsReady")]
    ClientReady { at: DateTime<Utc> },
    #[serde(rename = "initializing")]
    Initializing { force: bool },
    #[serde(rename = "restarting")]
    Restarting,
    #[serde(rename = "state_changed")]
    StateChanged {
        from: ConnectionPhase,
        to: ConnectionPhase,
        reason: String,
    },
    #[serde(rename = "error")]
    ErrorRecorded { kind: String, message: String },
    MessageSent {
        request_id: String,
        message_id: String,
        address: String,
    },
    MessageFailed {
        request_id: String,
        address: String,
        kind: String,
        error: String,
    },
    #[serde(rename = "message_status")]
    MessageStatus {
        request_id: String,
        message_id: String,
        ack_code: i32,
        status: DeliveryStatus,
    },
    #[serde(rename = "batch_started")]
    BatchStarted { total: usize },
    #[serde(rename = "finishedSending")]
    BatchFinished { sent: usize, failed: usize },
}

impl MessagingEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PairingCode { .. } => "qr",
            Self::ClientReady { .. } => "ClientIsReady",
            Self::Initializing { .. } => "initializing",
            Self::Restarting => "restarting",
            Self::StateChanged { .. } => "state_changed",
            Self::ErrorRecorded { .. } => "error",
            Self::MessageSent { .. } => "MessageSent",
            Self::MessageFailed { .. } => "MessageFailed",
            Self::MessageStatus { .. } => "message_status",
            Self::BatchStarted { .. } => "batch_started",
            Self::BatchFinished { .. } => "finishedSending",
        }
    }
}

/// Pairing code awaiting a scan
#[derive(Debug, Clone, Serialize)]
pub struct PairingSession {
    pub code: String,
    pub issued_at: DateTime<Utc>,
}

pub struct EventBus {
    tx: broadcast::Sender<MessagingEvent>,
    observers: Arc<AtomicUsize>,
    pairing: RwLock<Option<PairingSession>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: Arc::new(AtomicUsize::new(0)),
            pairing: RwLock::new(None),
        }
    }

    /// Returns the number of receivers the event reached
    pub fn publish(&self, event: MessagingEvent) -> usize {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(event_type, "event_without_receivers");
                0
            }
        }
    }

    /// Raw subscription; does not count as an observer
    pub fn subscribe(&self) -> broadcast::Receiver<MessagingEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a UI observer. The registration ends when the handle drops.
    pub fn register_observer(&self) -> ObserverHandle {
        let rx = self.tx.subscribe();
        let count = self.observers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(observers = count, "observer_registered");
        ObserverHandle {
            rx,
            observers: Arc::clone(&self.observers),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    /// Store a new pairing code; returns true if it was published
    pub fn set_pairing(&self, code: String) -> bool {
        let session = PairingSession {
            code,
            issued_at: Utc::now(),
        };
        *self.pairing.write() = Some(session.clone());

        if self.observer_count() == 0 {
            debug!("pairing_code_held_no_observers");
            return false;
        }
        self.publish(MessagingEvent::PairingCode {
            code: session.code,
            issued_at: session.issued_at,
        });
        true
    }

    /// Returns true if a pairing code was outstanding
    pub fn clear_pairing(&self) -> bool {
        self.pairing.write().take().is_some()
    }

    pub fn pairing(&self) -> Option<PairingSession> {
        self.pairing.read().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Registered observer. Dropping it unregisters.
pub struct ObserverHandle {
    rx: broadcast::Receiver<MessagingEvent>,
    observers: Arc<AtomicUsize>,
}

impl ObserverHandle {
    pub async fn recv(&mut self) -> Result<MessagingEvent, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        let remaining = self.observers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(observers = remaining, "observer_unregistered");
    }
}
