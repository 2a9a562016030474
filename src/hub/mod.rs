//! Server-accepting WebSocket endpoint for browser/internal consumers:
//! auth handshake, ping/pong liveness, non-blocking broadcast with
//! slow-consumer eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::fanout::EventHandler;
use crate::model::Event;

#[derive(Deserialize)]
struct AuthFrame {
    #[serde(rename = "type")]
    frame_type: String,
    api_key: String,
}

#[derive(Serialize)]
struct AuthResponse {
    #[serde(rename = "type")]
    frame_type: &'static str,
    success: bool,
    message: String,
}

enum HubCommand {
    Register(Uuid, mpsc::Sender<String>),
    Deregister(Uuid),
    Broadcast(Event),
}

/// Owns the registry of connected clients from a single internal loop task;
/// registrations, deregistrations, and broadcasts all arrive as commands so
/// the map is mutated from exactly one place.
pub struct EventHub {
    cmd_tx: mpsc::Sender<HubCommand>,
    config: HubConfig,
    client_count: Arc<AtomicUsize>,
    evictions: Arc<AtomicUsize>,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HubCommand>(256);
        let client_count = Arc::new(AtomicUsize::new(0));
        let evictions = Arc::new(AtomicUsize::new(0));
        let task_client_count = client_count.clone();
        let task_evictions = evictions.clone();
        tokio::spawn(async move {
            let mut clients: HashMap<Uuid, mpsc::Sender<String>> = HashMap::new();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HubCommand::Register(id, tx) => {
                        clients.insert(id, tx);
                        task_client_count.store(clients.len(), Ordering::SeqCst);
                    }
                    HubCommand::Deregister(id) => {
                        clients.remove(&id);
                        task_client_count.store(clients.len(), Ordering::SeqCst);
                    }
                    HubCommand::Broadcast(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to serialize event for hub broadcast");
                                continue;
                            }
                        };
                        let mut evicted = Vec::new();
                        for (id, tx) in clients.iter() {
                            if tx.try_send(payload.clone()).is_err() {
                                evicted.push(*id);
                            }
                        }
                        for id in evicted {
                            tracing::warn!(client_id = %id, "evicting slow hub client");
                            clients.remove(&id);
                            task_evictions.fetch_add(1, Ordering::SeqCst);
                        }
                        task_client_count.store(clients.len(), Ordering::SeqCst);
                    }
                }
            }
        });
        Arc::new(Self { cmd_tx, config, client_count, evictions })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(upgrade_handler))
            .with_state(self)
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    pub fn eviction_count(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for EventHub {
    async fn handle(&self, event: &Event) {
        let _ = self.cmd_tx.send(HubCommand::Broadcast(event.clone())).await;
    }

    fn name(&self) -> &'static str {
        "hub"
    }
}

async fn upgrade_handler(State(hub): State<Arc<EventHub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<EventHub>) {
    let (mut sink, mut stream) = socket.split();

    let authed = match tokio::time::timeout(hub.config.auth_timeout, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthFrame>(&text) {
            Ok(frame) if frame.frame_type == "auth" => {
                hub.config.api_key.is_empty() || frame.api_key == hub.config.api_key
            }
            _ => false,
        },
        _ => false,
    };

    let response = AuthResponse {
        frame_type: "auth_response",
        success: authed,
        message: if authed {
            "ok".to_string()
        } else {
            "authentication failed".to_string()
        },
    };
    let response_text = serde_json::to_string(&response).unwrap_or_default();
    let _ = tokio::time::timeout(hub.config.write_timeout, sink.send(Message::Text(response_text))).await;

    if !authed {
        let _ = sink.close().await;
        return;
    }

    let client_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let _ = hub.cmd_tx.send(HubCommand::Register(client_id, tx)).await;

    let mut ping_timer = tokio::time::interval(hub.config.ping_interval);
    ping_timer.tick().await; // first tick fires immediately
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if tokio::time::timeout(hub.config.write_timeout, sink.send(Message::Text(payload))).await.is_err() {
                            break;
                        }
                    }
                    None => break, // evicted or hub shut down
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => { awaiting_pong = false; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = ping_timer.tick() => {
                if awaiting_pong {
                    break; // no pong since the previous ping
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = hub.cmd_tx.send(HubCommand::Deregister(client_id)).await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use std::time::Duration as StdDuration;

    fn test_config() -> HubConfig {
        HubConfig {
            api_key: "secret".into(),
            ping_interval: StdDuration::from_secs(30),
            write_timeout: StdDuration::from_secs(10),
            auth_timeout: StdDuration::from_secs(10),
        }
    }

    #[test]
    fn auth_frame_parses_minimal_json() {
        let frame: AuthFrame = serde_json::from_str(r#"{"type":"auth","api_key":"x"}"#).unwrap();
        assert_eq!(frame.frame_type, "auth");
        assert_eq!(frame.api_key, "x");
    }

    #[tokio::test]
    async fn broadcast_with_no_clients_is_a_no_op() {
        let hub = EventHub::new(test_config());
        hub.handle(&Event::new(EventType::MessageReceived, "s1", serde_json::json!({})))
            .await;
        // no panic, no clients registered; nothing further to assert.
    }
}
