//! External collaborator interfaces. Everything in this module is
//! a trait: concrete implementations (the real protocol-client library, SQL
//! repositories, disk-backed media storage) are deliberately out of scope —
//! this crate only depends on these contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{MessageInfo, ProtocolEnvelope};
use crate::model::{Session, SessionStatus};

/// One of the two JID forms: a stable `<user>@<server>` or an
/// ephemeral linked-device identifier. Kept as a thin newtype-free alias;
/// resolution between the two is the session manager's job ("JID
/// resolution"), not a type-level distinction.
pub type Jid = String;

#[derive(Debug, Clone)]
pub enum Presence {
    Typing,
    Paused,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

#[derive(Debug, Clone)]
pub struct UploadDescriptor {
    pub url: String,
    pub media_key: Vec<u8>,
    pub file_sha256: String,
    pub file_length: u64,
}

#[derive(Debug, Clone)]
pub enum QrEvent {
    Code { data_base64_png: String },
    Authenticated { jid: Jid },
    Timeout,
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct Device {
    pub session_id: String,
    pub jid: Option<Jid>,
}

/// Opaque outbound message envelope accepted by the protocol client; this
/// crate only ever constructs it, never interprets it.
pub type OutboundEnvelope = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// One history-sync message as the protocol reports it, before normalization.
#[derive(Debug, Clone)]
pub struct HistoryMessageRaw {
    pub info: Option<MessageInfo>,
    pub envelope: ProtocolEnvelope,
    pub timestamp: DateTime<Utc>,
}

/// One conversation's worth of history-sync messages, plus the protocol's
/// own display name for that conversation (if it reported one).
#[derive(Debug, Clone)]
pub struct HistoryConversationRaw {
    pub chat_jid: Jid,
    pub display_name: Option<String>,
    pub messages: Vec<HistoryMessageRaw>,
}

/// One item off a connected client's event stream. The session manager's
/// single dispatch loop classifies each of these by variant and fans it out
/// ("message, connected, disconnected, logged_out, receipt, presence,
/// history_sync").
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Message {
        chat_jid: Jid,
        info: MessageInfo,
        envelope: ProtocolEnvelope,
    },
    Connected,
    Disconnected,
    LoggedOut,
    Receipt {
        kind: ReceiptKind,
        message_ids: Vec<String>,
        chat_jid: Jid,
    },
    Presence {
        jid: Jid,
        presence: Presence,
    },
    HistorySync(Vec<HistoryConversationRaw>),
}

/// A group participant as the protocol reports it, before LID resolution or
/// display-name attachment.
#[derive(Debug, Clone)]
pub struct RawGroupParticipant {
    pub jid: Jid,
    pub is_admin: bool,
}

/// A joined group as the protocol reports it.
#[derive(Debug, Clone)]
pub struct RawGroup {
    pub jid: Jid,
    pub name: String,
    pub participants: Vec<RawGroupParticipant>,
}

/// The external chat-protocol client library, treated as opaque. One
/// instance is bound to exactly one session, owned exclusively by the
/// session manager.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn send_message(&self, jid: &Jid, envelope: OutboundEnvelope) -> Result<()>;
    async fn upload(&self, bytes: Vec<u8>, kind: MediaKind) -> Result<UploadDescriptor>;
    async fn download(&self, media_url: &str, media_key: &[u8]) -> Result<Vec<u8>>;
    fn get_qr_channel(&self) -> mpsc::Receiver<QrEvent>;
    /// The session manager's single handle onto this client's classified
    /// inbound event stream; see [`ProtocolEvent`].
    fn event_stream(&self) -> mpsc::Receiver<ProtocolEvent>;
    async fn mark_read(
        &self,
        message_ids: &[String],
        chat_jid: &Jid,
        sender_jid: &Jid,
    ) -> Result<()>;
    async fn send_presence(&self, presence: Presence) -> Result<()>;
    async fn send_chat_presence(&self, jid: &Jid, presence: Presence) -> Result<()>;
    async fn get_joined_groups(&self) -> Result<Vec<RawGroup>>;
}

/// Per-device contact/LID bookkeeping, owned by the protocol client's own
/// backing store ("companion device store"). The session manager never
/// caches handles across reconnects; it always re-resolves through here.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_all_devices(&self) -> Result<Vec<Device>>;
    async fn new_device(&self, session_id: &str) -> Result<Device>;
    async fn put_push_name(&self, jid: &Jid, push_name: &str) -> Result<()>;
    async fn get_contact(&self, jid: &Jid) -> Result<Option<String>>;
    /// Resolve an ephemeral LID to its stable phone-number JID, if known.
    async fn get_pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Session>>;
    async fn create(&self, session: Session) -> Result<()>;
    async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()>;
    async fn update_jid(&self, id: &str, jid: &Jid) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Storage collaborator for media downloads: validates declared sizes against configured
/// limits and persists the plaintext stream, returning a path and a public URL.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    fn max_bytes(&self) -> u64;
    async fn store(
        &self,
        session_id: &str,
        message_id: &str,
        mimetype: &str,
        extension: &str,
        plaintext: Vec<u8>,
    ) -> Result<StoredMedia>;
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub path: String,
    pub public_url: String,
}

/// Persistence sink for a filtered view of events.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn write(&self, event: &crate::model::Event) -> Result<()>;
}

/// Audit-log collaborator used by the webhook dispatcher to record
/// non-2xx responses and network errors; never surfaced to the caller.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, source: &str, message: &str);
}

/// A no-op audit log for configurations where none is wired up; logs via
/// `tracing` instead of a collaborator-backed store.
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(&self, source: &str, message: &str) {
        tracing::warn!(source, message, "audit event (no audit-log collaborator configured)");
    }
}

pub fn session_not_found(id: &str) -> Error {
    Error::SessionNotFound(id.to_string())
}
