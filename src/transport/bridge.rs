//! Chat bridge transport
//!
//! Talks to the chat-client sidecar over a WebSocket carrying JSON frames:
//! - outbound `{"op": ..., "request_id": ...}` commands
//!   (init, send, state, destroy, logout)
//! - inbound lifecycle events (ready, qr, auth_failure, disconnected, ack)
//!   and `reply` frames correlated by request id
//!
//! One connection per session. The connection worker owns both halves of the
//! socket; callers go through a command channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::messaging::transport::{
    AuthConfig, Transport, TransportEvent, TransportHandle, TransportSession,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeOp {
    Init { client_id: String, data_path: String },
    Send { to: String, body: String },
    State,
    Destroy,
    Logout,
}

#[derive(Serialize)]
struct Envelope<'a> {
    request_id: &'a str,
    #[serde(flatten)]
    op: &'a BridgeOp,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Ready,
    Qr {
        code: String,
    },
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Ack {
        message_id: String,
        ack: i32,
    },
    Reply {
        request_id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

impl BridgeFrame {
    fn into_event(self) -> Option<TransportEvent> {
        match self {
            Self::Ready => Some(TransportEvent::Ready),
            Self::Qr { code } => Some(TransportEvent::PairingCode(code)),
            Self::AuthFailure { message } => Some(TransportEvent::AuthFailure(message)),
            Self::Disconnected { reason } => Some(TransportEvent::Disconnected(reason)),
            Self::Ack { message_id, ack } => Some(TransportEvent::MessageAcknowledged {
                message_id,
                ack_code: ack,
            }),
            Self::Reply { .. } => None,
        }
    }
}

struct Command {
    op: BridgeOp,
    reply: oneshot::Sender<Result<Value>>,
}

/// Transport backed by the chat bridge sidecar
pub struct BridgeTransport {
    url: String,
    request_timeout: Duration,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn create_session(&self, auth: &AuthConfig) -> Result<TransportHandle> {
        info!(url = %self.url, client_id = %auth.client_id, "bridge_connecting");
        let (ws_stream, resp) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connect to chat bridge at {}", self.url))?;
        debug!(status = %resp.status(), "bridge_connected");

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);

        tokio::spawn(async move {
            if let Err(e) = run_connection(ws_stream, cmd_rx, event_tx).await {
                warn!(error = %e, "bridge_connection_ended");
            }
        });

        let session = Arc::new(BridgeSession {
            cmd_tx,
            request_timeout: self.request_timeout,
        });

        // The sidecar starts its client on init; lifecycle events follow.
        session
            .request(BridgeOp::Init {
                client_id: auth.client_id.clone(),
                data_path: auth.data_path.display().to_string(),
            })
            .await
            .context("bridge init")?;

        Ok(TransportHandle {
            session,
            events: event_rx,
        })
    }

    async fn clear_auth(&self, auth: &AuthConfig) -> Result<()> {
        remove_auth_dir(&auth.data_path).await
    }
}

async fn remove_auth_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!(path = %path.display(), "stored_auth_removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove auth data at {}", path.display())),
    }
}

/// Handle to one bridge connection
pub struct BridgeSession {
    cmd_tx: mpsc::Sender<Command>,
    request_timeout: Duration,
}

impl BridgeSession {
    async fn request(&self, op: BridgeOp) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command { op, reply })
            .await
            .map_err(|_| anyhow!("bridge connection closed"))?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("bridge connection closed before reply")),
            Err(_) => Err(anyhow!(
                "bridge did not reply within {}ms",
                self.request_timeout.as_millis()
            )),
        }
    }
}

#[async_trait]
impl TransportSession for BridgeSession {
    async fn send(&self, address: &str, payload: &str) -> Result<String> {
        let result = self
            .request(BridgeOp::Send {
                to: address.to_string(),
                body: payload.to_string(),
            })
            .await?;

        result
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("bridge send reply missing message_id"))
    }

    async fn connection_state(&self) -> Result<String> {
        let result = self.request(BridgeOp::State).await?;
        Ok(result
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string())
    }

    async fn destroy(&self) -> Result<()> {
        self.request(BridgeOp::Destroy).await.map(|_| ())
    }

    async fn logout(&self) -> Result<()> {
        self.request(BridgeOp::Logout).await.map(|_| ())
    }
}

async fn run_connection<S>(
    ws_stream: S,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<()>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let mut pending: HashMap<String, oneshot::Sender<Result<Value>>> = HashMap::new();

    let outcome = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                // Every session handle dropped
                let Some(cmd) = cmd else {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                };

                let request_id = uuid::Uuid::new_v4().to_string();
                let frame = match serde_json::to_string(&Envelope { request_id: &request_id, op: &cmd.op }) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = cmd.reply.send(Err(e.into()));
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Text(frame)).await {
                    let _ = cmd.reply.send(Err(anyhow!("bridge write failed: {e}")));
                    break Err(anyhow!("bridge write failed: {e}"));
                }
                pending.insert(request_id, cmd.reply);
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    break Err(anyhow!("bridge stream ended"));
                };

                match msg {
                    Ok(Message::Text(text)) => {
                        handle_frame(&text, &mut pending, &event_tx).await;
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "bridge_close_frame");
                        break Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => break Err(anyhow!("bridge ws error: {e}")),
                }
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(anyhow!("bridge connection closed")));
    }
    let reason = match &outcome {
        Ok(()) => "bridge connection closed".to_string(),
        Err(e) => format!("{e:#}"),
    };
    let _ = event_tx.send(TransportEvent::Disconnected(reason)).await;

    outcome
}

async fn handle_frame(
    text: &str,
    pending: &mut HashMap<String, oneshot::Sender<Result<Value>>>,
    event_tx: &mpsc::Sender<TransportEvent>,
) {
    let frame: BridgeFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "bridge_frame_unparsed");
            return;
        }
    };

    if let BridgeFrame::Reply {
        request_id,
        ok,
        result,
        error,
    } = frame
    {
        let Some(reply) = pending.remove(&request_id) else {
            debug!(%request_id, "bridge_reply_without_request");
            return;
        };
        let result = if ok {
            Ok(result)
        } else {
            Err(anyhow!(error.unwrap_or_else(|| "bridge request failed".to_string())))
        };
        let _ = reply.send(result);
        return;
    }

    if let Some(event) = frame.into_event() {
        if event_tx.send(event).await.is_err() {
            debug!("bridge_event_receiver_dropped");
        }
    }
}
