//! Optional signed-POST delivery of events to an external URL. Never
//! propagates failures to the caller — non-2xx responses and network errors
//! go to the audit-log collaborator only.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::crypto::sign_webhook_body;
use crate::fanout::EventHandler;
use crate::model::Event;
use crate::protocol::AuditLog;

#[derive(Clone)]
pub struct WebhookDispatcher {
    url: String,
    secret: String,
    events_filter: HashSet<String>,
    timeout: Duration,
    client: reqwest::Client,
    audit: Arc<dyn AuditLog>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl WebhookDispatcher {
    pub fn new(url: String, secret: String, events: Vec<String>, timeout: Duration, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            url,
            secret,
            events_filter: events.into_iter().collect(),
            timeout,
            client: reqwest::Client::new(),
            audit,
            delivered: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    fn accepts(&self, event: &Event) -> bool {
        self.events_filter.is_empty() || self.events_filter.contains(event.event_type.as_wire_str())
    }

    async fn deliver(&self, event: &Event) {
        if !self.accepts(event) {
            return;
        }
        let body = match serde_json::to_string(event) {
            Ok(b) => b,
            Err(e) => {
                self.audit.record("webhook", &format!("failed to serialize event: {e}")).await;
                return;
            }
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let signature = sign_webhook_body(&self.secret, timestamp, body.as_bytes());

        let result = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Timestamp", timestamp.to_string())
            .header("X-Webhook-Signature", signature)
            .body(body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
            Ok(resp) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.audit
                    .record("webhook", &format!("non-2xx response: {}", resp.status()))
                    .await;
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.audit.record("webhook", &format!("delivery failed: {e}")).await;
            }
        }
    }
}

#[async_trait]
impl EventHandler for WebhookDispatcher {
    async fn handle(&self, event: &Event) {
        if !self.accepts(event) {
            return;
        }
        // deliver() is a network call; spawning keeps this handle() call
        // prompt as the fan-out wiring requires.
        let body_event = event.clone();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.deliver(&body_event).await;
        });
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
