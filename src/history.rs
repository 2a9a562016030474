//! Filtered ingestion of the protocol's bulk history dump into the same
//! fan-out wiring realtime messages use.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::fanout::FanoutWiring;
use crate::message::{parse_history, MessageInfo, ProtocolEnvelope};
use crate::model::{Event, EventType};
use crate::protocol::DeviceStore;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub full_sync: bool,
    /// Checkpoint below which messages are dropped. This handler neither
    /// reads nor writes a persisted checkpoint — the caller supplies it and
    /// is responsible for storing the next value.
    pub since: Option<DateTime<Utc>>,
}

pub struct HistoryMessage {
    pub info: Option<MessageInfo>,
    pub envelope: ProtocolEnvelope,
    pub timestamp: DateTime<Utc>,
}

/// One conversation's worth of history messages, plus the protocol's own
/// display name for the conversation, if it reported one.
pub struct HistoryConversation {
    pub chat_jid: String,
    pub display_name: Option<String>,
    pub messages: Vec<HistoryMessage>,
}

pub struct HistoryBatch {
    pub conversations: Vec<HistoryConversation>,
}

pub struct HistoryHandler {
    devices: Arc<dyn DeviceStore>,
    events: Arc<FanoutWiring>,
}

impl HistoryHandler {
    pub fn new(devices: Arc<dyn DeviceStore>, events: Arc<FanoutWiring>) -> Self {
        Self { devices, events }
    }

    pub async fn ingest(&self, session_id: &str, config: &HistoryConfig, batch: HistoryBatch) {
        if !config.enabled {
            return;
        }

        let since = if config.full_sync {
            None
        } else {
            match config.since {
                Some(since) => Some(since),
                None => {
                    tracing::warn!(session_id, "history sync configured incrementally with no checkpoint, falling back to full sync");
                    None
                }
            }
        };

        let mut stored = 0u64;
        let mut dropped = 0u64;

        for conversation in batch.conversations {
            if let Some(display_name) = &conversation.display_name {
                let _ = self.devices.put_push_name(&conversation.chat_jid, display_name).await;
            }

            for message in conversation.messages {
                if let Some(since) = since {
                    if message.timestamp < since {
                        dropped += 1;
                        continue;
                    }
                }

                let mut normalized =
                    parse_history(session_id, &conversation.chat_jid, &message.envelope, message.info.as_ref());
                if !normalized.is_group() {
                    dropped += 1;
                    continue;
                }

                if normalized.sender_jid.ends_with("@lid") {
                    if let Ok(Some(resolved)) = self.devices.get_pn_for_lid(&normalized.sender_jid).await {
                        normalized.sender_jid = resolved;
                    }
                }

                self.events
                    .publish(Event::new(
                        EventType::MessageReceived,
                        session_id,
                        serde_json::to_value(&normalized).unwrap_or(serde_json::json!({})),
                    ))
                    .await;
                stored += 1;
            }
        }

        self.events
            .publish(Event::new(
                EventType::SyncProgress,
                session_id,
                serde_json::json!({ "stored": stored, "dropped": dropped, "total": stored + dropped }),
            ))
            .await;
    }
}
