//! Observer socket: live messaging events for the UI

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::routes::AppState;
use crate::messaging::MessagingEvent;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Registered before the replay so a pairing code issued meanwhile is not lost
    let mut observer = state.supervisor.register_observer();

    let status = state.supervisor.status();
    let pairing = status.pairing.clone();
    let hello = json!({ "type": "status", "data": status });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    // Replay an outstanding pairing code so a late observer can still scan it
    if let Some(pairing) = pairing {
        let event = MessagingEvent::PairingCode {
            code: pairing.code,
            issued_at: pairing.issued_at,
        };
        if !send_event(&mut socket, &event).await {
            return;
        }
    }

    state.supervisor.on_observer_connected();
    debug!(observers = state.supervisor.status().observers, "observer_connected");

    loop {
        tokio::select! {
            event = observer.recv() => match event {
                Ok(event) => {
                    if !send_event(&mut socket, &event).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer_lagged");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                        if json.get("type").and_then(|t| t.as_str()) == Some("ping") {
                            let timestamp = json
                                .get("data")
                                .and_then(|d| d.get("timestamp"))
                                .and_then(|t| t.as_i64())
                                .unwrap_or(0);
                            let pong = json!({
                                "type": "pong",
                                "data": { "timestamp": timestamp }
                            });
                            let _ = socket.send(Message::Text(pong.to_string())).await;
                        }
                    } else if text == "ping" {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "observer_socket_error");
                    break;
                }
            },
        }
    }

    debug!("observer_disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &MessagingEvent) -> bool {
    let msg = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("Failed to serialize ws event: {}", e);
        "{}".to_string()
    });
    socket.send(Message::Text(msg)).await.is_ok()
}
