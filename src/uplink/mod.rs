//! Single outbound WebSocket to a configured upstream: auth handshake,
//! doubling reconnect backoff, and a drop-oldest publish FIFO drained by a
//! dedicated flush task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::UplinkConfig;
use crate::fanout::EventHandler;
use crate::model::Event;

#[derive(Serialize)]
struct AuthFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    api_key: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(rename = "type")]
    frame_type: String,
    success: bool,
}

struct Fifo {
    queue: VecDeque<String>,
    capacity: usize,
}

impl Fifo {
    fn push(&mut self, payload: String) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(payload);
    }
}

/// Publishes events onto the upstream socket. `publish`/`handle` only
/// enqueue; a background task owns the socket and drains the queue.
pub struct UplinkPublisher {
    config: UplinkConfig,
    queue: Arc<Mutex<Fifo>>,
    notify: Arc<Notify>,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl UplinkPublisher {
    pub fn start(config: UplinkConfig, reconnect_delay: Duration, max_reconnects: u32) -> Self {
        let queue = Arc::new(Mutex::new(Fifo {
            queue: VecDeque::new(),
            capacity: config.queue_size.max(1),
        }));
        let notify = Arc::new(Notify::new());
        let connected = Arc::new(AtomicBool::new(false));
        let reconnects = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task_config = config.clone();
        let task_queue = queue.clone();
        let task_notify = notify.clone();
        let task_connected = connected.clone();
        let task_reconnects = reconnects.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run(
                task_config,
                reconnect_delay,
                max_reconnects,
                task_queue,
                task_notify,
                task_connected,
                task_reconnects,
                task_cancel,
            )
            .await;
        });

        Self {
            config,
            queue,
            notify,
            connected,
            reconnects,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.queue.len()
    }

    async fn enqueue(&self, payload: String) {
        self.queue.lock().await.push(payload);
        self.notify.notify_one();
    }

    /// Best-effort flush within a grace window, then tears down the
    /// background task.
    pub async fn shutdown(mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.queue.lock().await.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.cancel.cancel();
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }
}

#[async_trait]
impl EventHandler for UplinkPublisher {
    async fn handle(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(payload) => self.enqueue(payload).await,
            Err(e) => tracing::error!(error = %e, "failed to serialize event for uplink"),
        }
    }

    fn name(&self) -> &'static str {
        "uplink"
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: UplinkConfig,
    reconnect_delay: Duration,
    max_reconnects: u32,
    queue: Arc<Mutex<Fifo>>,
    notify: Arc<Notify>,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let base_delay = reconnect_delay;
    let cap = Duration::from_secs(60) * max_reconnects.max(1);
    let mut delay = base_delay;
    let mut first_attempt = true;

    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }
        if !first_attempt {
            reconnects.fetch_add(1, Ordering::SeqCst);
        }
        first_attempt = false;
        match connect_and_auth(&config).await {
            Ok(stream) => {
                delay = base_delay;
                connected.store(true, Ordering::SeqCst);
                flush_loop(stream, &config, &queue, &notify, &cancel).await;
                connected.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!(error = %e, "uplink connect failed, retrying");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break 'reconnect,
        }
        delay = (delay * 2).min(cap);
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_and_auth(config: &UplinkConfig) -> Result<WsStream, String> {
    let (mut stream, _) = tokio_tungstenite::connect_async(&config.url)
        .await
        .map_err(|e| e.to_string())?;
    let auth = AuthFrame {
        frame_type: "auth",
        api_key: &config.api_key,
    };
    let payload = serde_json::to_string(&auth).map_err(|e| e.to_string())?;
    stream.send(Message::Text(payload)).await.map_err(|e| e.to_string())?;

    let response = tokio::time::timeout(config.pong_timeout, stream.next())
        .await
        .map_err(|_| "auth response timed out".to_string())?
        .ok_or_else(|| "upstream closed during auth".to_string())?
        .map_err(|e| e.to_string())?;

    let Message::Text(text) = response else {
        return Err("unexpected auth response frame".to_string());
    };
    let parsed: AuthResponse = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    if parsed.frame_type != "auth_response" || !parsed.success {
        return Err("upstream rejected auth".to_string());
    }
    Ok(stream)
}

async fn flush_loop(
    mut stream: WsStream,
    config: &UplinkConfig,
    queue: &Arc<Mutex<Fifo>>,
    notify: &Arc<Notify>,
    cancel: &CancellationToken,
) {
    let mut ping_timer = tokio::time::interval(config.ping_interval);
    loop {
        let next = { queue.lock().await.queue.pop_front() };
        let Some(payload) = next else {
            tokio::select! {
                _ = notify.notified() => continue,
                _ = ping_timer.tick() => {
                    if stream.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                    continue;
                }
                incoming = stream.next() => {
                    if !matches!(incoming, Some(Ok(_))) {
                        return;
                    }
                    continue;
                }
                _ = cancel.cancelled() => return,
            };
        };
        if stream.send(Message::Text(payload.clone())).await.is_err() {
            queue.lock().await.queue.push_front(payload);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_drops_oldest_when_full() {
        let mut fifo = Fifo {
            queue: VecDeque::new(),
            capacity: 2,
        };
        fifo.push("a".into());
        fifo.push("b".into());
        fifo.push("c".into());
        assert_eq!(fifo.queue.len(), 2);
        assert_eq!(fifo.queue.front().map(String::as_str), Some("b"));
        assert_eq!(fifo.queue.back().map(String::as_str), Some("c"));
    }

    #[tokio::test]
    async fn starts_disconnected_and_reports_queue_size() {
        let publisher = UplinkPublisher::start(
            UplinkConfig {
                url: "ws://127.0.0.1:1/nope".into(),
                api_key: "k".into(),
                ping_interval: Duration::from_secs(30),
                pong_timeout: Duration::from_millis(50),
                queue_size: 10,
            },
            Duration::from_secs(5),
            1,
        );
        assert!(!publisher.is_connected());
        publisher.handle(&Event::new(crate::model::EventType::MessageReceived, "s1", serde_json::json!({}))).await;
        assert_eq!(publisher.queue_size().await, 1);
        publisher.shutdown(Duration::from_millis(10)).await;
    }
}
