//! Shared data model: the types every component passes around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Connecting,
    Connected,
    Disconnected,
    LoggedOut,
}

/// One authenticated binding between this gateway and one remote chat account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub display_name: String,
    pub status: SessionStatus,
    pub jid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            status: SessionStatus::Pending,
            jid: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Contact,
    Location,
    Poll,
    Reaction,
    Protocol,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Realtime,
    History,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFlags {
    pub is_from_me: bool,
    pub is_forwarded: bool,
    pub is_view_once: bool,
    pub is_broadcast: bool,
}

/// Produced by the message parser from one protocol envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub session_id: String,
    pub chat_jid: String,
    pub sender_jid: String,
    pub sender_push_name: Option<String>,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    pub media_url: Option<String>,
    #[serde(with = "opaque_bytes")]
    pub media_key: Option<Vec<u8>>,
    pub media_sha256: Option<String>,
    pub media_size: Option<u64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub vcard: Option<String>,
    pub poll_name: Option<String>,
    pub poll_options: Vec<String>,
    pub reaction_emoji: Option<String>,
    pub reaction_target_id: Option<String>,
    pub flags: MessageFlags,
    pub quoted_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: MessageSource,
    /// Opaque serialized envelope, retained verbatim.
    pub raw_payload: serde_json::Value,
}

mod opaque_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => STANDARD.encode(bytes).serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        opt.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl NormalizedMessage {
    /// True when `chat_jid` denotes a group.
    pub fn is_group(&self) -> bool {
        self.chat_jid.ends_with("@g.us")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.delivered")]
    MessageDelivered,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "message.reaction")]
    MessageReaction,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.failed")]
    MessageFailed,
    #[serde(rename = "presence.update")]
    PresenceUpdate,
    #[serde(rename = "connection.connected")]
    ConnectionConnected,
    #[serde(rename = "connection.disconnected")]
    ConnectionDisconnected,
    #[serde(rename = "connection.logged_out")]
    ConnectionLoggedOut,
    #[serde(rename = "sync.progress")]
    SyncProgress,
}

impl EventType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            EventType::MessageReceived => "message.received",
            EventType::MessageDelivered => "message.delivered",
            EventType::MessageRead => "message.read",
            EventType::MessageReaction => "message.reaction",
            EventType::MessageSent => "message.sent",
            EventType::MessageFailed => "message.failed",
            EventType::PresenceUpdate => "presence.update",
            EventType::ConnectionConnected => "connection.connected",
            EventType::ConnectionDisconnected => "connection.disconnected",
            EventType::ConnectionLoggedOut => "connection.logged_out",
            EventType::SyncProgress => "sync.progress",
        }
    }
}

/// Envelope carrying {id, type, session_id, timestamp, payload} as sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, session_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Text,
    Image,
    Document,
    Audio,
    Video,
}

/// A group participant after LID resolution and display-name attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub jid: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
}

/// A joined group, resolved for external consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub jid: String,
    pub name: String,
    pub participants: Vec<GroupMember>,
}

/// Ownership transfers to the worker on dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOutbound {
    pub message_id: String,
    pub session_id: String,
    pub recipient: String,
    pub kind: OutboundKind,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media_path: Option<String>,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_detection_by_suffix() {
        let mut m = sample_message();
        m.chat_jid = "12025550123-1234@g.us".to_string();
        assert!(m.is_group());
        m.chat_jid = "12025550123@s.whatsapp.net".to_string();
        assert!(!m.is_group());
    }

    #[test]
    fn event_type_wire_strings_match_external_api() {
        assert_eq!(EventType::MessageReceived.as_wire_str(), "message.received");
        assert_eq!(EventType::SyncProgress.as_wire_str(), "sync.progress");
        assert_eq!(
            EventType::ConnectionLoggedOut.as_wire_str(),
            "connection.logged_out"
        );
    }

    fn sample_message() -> NormalizedMessage {
        NormalizedMessage {
            message_id: "m1".into(),
            session_id: "s1".into(),
            chat_jid: "x@s.whatsapp.net".into(),
            sender_jid: "x@s.whatsapp.net".into(),
            sender_push_name: None,
            message_type: MessageType::Text,
            text: Some("hi".into()),
            caption: None,
            filename: None,
            mimetype: None,
            media_url: None,
            media_key: None,
            media_sha256: None,
            media_size: None,
            latitude: None,
            longitude: None,
            address: None,
            vcard: None,
            poll_name: None,
            poll_options: vec![],
            reaction_emoji: None,
            reaction_target_id: None,
            flags: MessageFlags::default(),
            quoted_message_id: None,
            timestamp: Utc::now(),
            source: MessageSource::Realtime,
            raw_payload: serde_json::json!({}),
        }
    }
}
