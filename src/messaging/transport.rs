//! Chat transport boundary
//!
//! The transport is a black box: it creates sessions, sends payloads, and
//! reports lifecycle and acknowledgement events on a channel.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle and acknowledgement events from a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Ready,
    PairingCode(String),
    AuthFailure(String),
    Disconnected(String),
    MessageAcknowledged { message_id: String, ack_code: i32 },
}

/// Where the transport keeps the session's credentials
#[derive(Debug, Clone, Serialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub data_path: PathBuf,
}

/// A freshly created session and its event stream
pub struct TransportHandle {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_session(&self, auth: &AuthConfig) -> anyhow::Result<TransportHandle>;

    /// Invalidate stored credentials when no session is attached
    async fn clear_auth(&self, _auth: &AuthConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Returns the transport's message id
    async fn send(&self, address: &str, payload: &str) -> anyhow::Result<String>;

    async fn connection_state(&self) -> anyhow::Result<String>;

    /// Close the session, keeping stored credentials
    async fn destroy(&self) -> anyhow::Result<()>;

    /// Close the session and invalidate stored credentials
    async fn logout(&self) -> anyhow::Result<()>;
}
