//! Scripted in-process transport for driving the supervisor end to end

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use clinic_messenger::messaging::{
    AuthConfig, CircuitBreakerConfig, MessagingConfig, ReconnectConfig, SessionSupervisor,
    Transport, TransportEvent, TransportHandle, TransportSession,
};
use clinic_messenger::storage::SqliteDeliveryStore;

/// What a newly created session does on its own
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reports ready after `delay`
    Ready { delay: Duration },
    /// Issues a pairing code and never becomes ready
    PairingOnly { code: String },
    /// Stays quiet for `delay`, then issues a pairing code
    LatePairing { delay: Duration, code: String },
    /// Never reports anything
    Silent,
    /// Rejects the stored credentials
    AuthFailure { message: String },
    /// `create_session` itself fails
    Unreachable,
}

pub struct ScriptedTransport {
    behavior: Mutex<Behavior>,
    disconnect_after_sends: Mutex<Option<usize>>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
    created: AtomicUsize,
    auth_cleared: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            disconnect_after_sends: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            auth_cleared: AtomicBool::new(false),
        })
    }

    pub fn ready() -> Arc<Self> {
        Self::new(Behavior::Ready {
            delay: Duration::from_millis(50),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Sessions created from now on drop after their `n`th send
    pub fn disconnect_after_sends(&self, n: usize) {
        *self.disconnect_after_sends.lock() = Some(n);
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_session(&self) -> Option<Arc<ScriptedSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn auth_cleared(&self) -> bool {
        self.auth_cleared.load(Ordering::SeqCst)
    }

    /// Emit an event on the most recent session's stream
    pub async fn emit(&self, event: TransportEvent) {
        if let Some(session) = self.last_session() {
            let _ = session.events.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn create_session(&self, _auth: &AuthConfig) -> Result<TransportHandle> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        if matches!(behavior, Behavior::Unreachable) {
            return Err(anyhow!("bridge unreachable"));
        }

        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(ScriptedSession {
            events: tx.clone(),
            sent: Mutex::new(Vec::new()),
            disconnect_after: *self.disconnect_after_sends.lock(),
            next_id: AtomicU64::new(0),
            reported_state: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
        });
        self.sessions.lock().push(Arc::clone(&session));

        tokio::spawn(async move {
            match behavior {
                Behavior::Ready { delay } => {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TransportEvent::Ready).await;
                }
                Behavior::PairingOnly { code } => {
                    let _ = tx.send(TransportEvent::PairingCode(code)).await;
                }
                Behavior::LatePairing { delay, code } => {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TransportEvent::PairingCode(code)).await;
                }
                Behavior::AuthFailure { message } => {
                    let _ = tx.send(TransportEvent::AuthFailure(message)).await;
                }
                Behavior::Silent | Behavior::Unreachable => {}
            }
        });

        Ok(TransportHandle {
            session,
            events: rx,
        })
    }

    async fn clear_auth(&self, _auth: &AuthConfig) -> Result<()> {
        self.auth_cleared.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedSession {
    events: mpsc::Sender<TransportEvent>,
    sent: Mutex<Vec<(String, String)>>,
    disconnect_after: Option<usize>,
    next_id: AtomicU64,
    reported_state: Mutex<Option<String>>,
    destroyed: AtomicBool,
    logged_out: AtomicBool,
}

impl ScriptedSession {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// Override what `connection_state` answers
    pub fn report_state(&self, state: &str) {
        *self.reported_state.lock() = Some(state.to_string());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn send(&self, address: &str, payload: &str) -> Result<String> {
        if self.is_destroyed() {
            return Err(anyhow!("session closed"));
        }

        let count = {
            let mut sent = self.sent.lock();
            sent.push((address.to_string(), payload.to_string()));
            sent.len()
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        if self.disconnect_after == Some(count) {
            let _ = self
                .events
                .send(TransportEvent::Disconnected("phone offline".to_string()))
                .await;
        }
        Ok(format!("msg-{}", id))
    }

    async fn connection_state(&self) -> Result<String> {
        if let Some(state) = self.reported_state.lock().clone() {
            return Ok(state);
        }
        Ok(if self.is_destroyed() { "CLOSED" } else { "CONNECTED" }.to_string())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Short windows so paused-clock tests stay readable
pub fn test_config() -> MessagingConfig {
    MessagingConfig {
        init_timeout: Duration::from_secs(5),
        pairing_timeout: Duration::from_secs(2),
        lock_timeout: Duration::from_secs(5),
        send_delay: Duration::from_millis(10),
        send_timeout: Duration::from_secs(1),
        teardown_timeout: Duration::from_secs(1),
        bootstrap_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 1,
        },
        reconnect: ReconnectConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
            max_attempts: 10,
            jitter_min: 1.0,
            jitter_max: 1.0,
        },
        ..MessagingConfig::default()
    }
}

pub fn supervisor_with(
    transport: Arc<ScriptedTransport>,
) -> (Arc<SessionSupervisor>, Arc<SqliteDeliveryStore>) {
    supervisor_with_config(transport, test_config())
}

pub fn supervisor_with_config(
    transport: Arc<ScriptedTransport>,
    config: MessagingConfig,
) -> (Arc<SessionSupervisor>, Arc<SqliteDeliveryStore>) {
    let store = Arc::new(SqliteDeliveryStore::new(":memory:").unwrap());
    let supervisor = SessionSupervisor::new(config, transport, store.clone());
    (supervisor, store)
}

/// Let spawned pumps and handlers run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
