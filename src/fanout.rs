//! Registers the ordered set of handlers that process every inbound
//! event. Handlers never propagate errors back to the
//! dispatcher — the ones with actual I/O (persistence, session-status,
//! webhook) offload it to a spawned task so `publish` stays prompt.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Event, EventType};
use crate::protocol::SessionRepository;
use crate::protocol::EventRepository;

/// A fan-out handler. Implementations of slow steps (a webhook POST, a
/// repository write) must offload internally — `handle` itself must return
/// promptly so it never blocks the caller's dispatch loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
    fn name(&self) -> &'static str;
}

/// Registers handlers in a fixed order and dispatches every event to each of
/// them in turn ("events reach each handler in the order the
/// session manager observed them").
pub struct FanoutWiring {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Default for FanoutWiring {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutWiring {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        tracing::debug!(handler = handler.name(), "registered fan-out handler");
        self.handlers.push(handler);
    }

    pub async fn publish(&self, event: Event) {
        for handler in &self.handlers {
            handler.handle(&event).await;
        }
    }
}

/// The uplink and webhook handlers, fanned out
/// sequentially. Order between uplink and webhook is preserved; order across
/// other destinations (hub, persistence) is not.
pub struct CompositeHandler {
    uplink: Arc<dyn EventHandler>,
    webhook: Option<Arc<dyn EventHandler>>,
}

impl CompositeHandler {
    pub fn new(uplink: Arc<dyn EventHandler>, webhook: Option<Arc<dyn EventHandler>>) -> Self {
        Self { uplink, webhook }
    }
}

#[async_trait]
impl EventHandler for CompositeHandler {
    async fn handle(&self, event: &Event) {
        self.uplink.handle(event).await;
        if let Some(webhook) = &self.webhook {
            webhook.handle(event).await;
        }
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}

/// Writes persisted event types to the event repository off the
/// caller's task.
pub struct PersistenceSink {
    repo: Arc<dyn EventRepository>,
    enabled: bool,
    persisted_types: HashSet<&'static str>,
}

impl PersistenceSink {
    pub fn new(repo: Arc<dyn EventRepository>, enabled: bool, persisted_types: HashSet<&'static str>) -> Self {
        Self {
            repo,
            enabled,
            persisted_types,
        }
    }
}

#[async_trait]
impl EventHandler for PersistenceSink {
    async fn handle(&self, event: &Event) {
        if !self.enabled || !self.persisted_types.contains(event.event_type.as_wire_str()) {
            return;
        }
        let repo = self.repo.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.write(&event).await {
                tracing::error!(error = %e, event_id = %event.id, "failed to persist event");
            }
        });
    }

    fn name(&self) -> &'static str {
        "persistence-sink"
    }
}

/// Updates the session repository's status field on connection
/// lifecycle events.
pub struct SessionStatusSink {
    repo: Arc<dyn SessionRepository>,
}

impl SessionStatusSink {
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl EventHandler for SessionStatusSink {
    async fn handle(&self, event: &Event) {
        use crate::model::SessionStatus;
        let status = match event.event_type {
            EventType::ConnectionConnected => SessionStatus::Connected,
            EventType::ConnectionDisconnected => SessionStatus::Disconnected,
            EventType::ConnectionLoggedOut => SessionStatus::LoggedOut,
            _ => return,
        };
        let repo = self.repo.clone();
        let session_id = event.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.update_status(&session_id, status).await {
                tracing::error!(error = %e, session_id, "failed to update session status");
            }
        });
    }

    fn name(&self) -> &'static str {
        "session-status-sink"
    }
}
