//! In-memory stand-ins for the external collaborators this binary wires up:
//! a session/device store, an event-persistence repository, media storage,
//! and the protocol client library itself. None of these ship in the
//! library crate — a real deployment brings its own implementations of the
//! traits in `protocol`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use wa_gateway_core::error::{Error, Result};
use wa_gateway_core::model::{Event, Session, SessionStatus};
use wa_gateway_core::protocol::{
    session_not_found, Device, DeviceStore, EventRepository, Jid, MediaKind, OutboundEnvelope,
    Presence, ProtocolClient, ProtocolEvent, QrEvent, RawGroup, SessionRepository, StoredMedia,
    UploadDescriptor,
};

#[derive(Default)]
pub struct InMemorySessions {
    sessions: Mutex<HashMap<String, Session>>,
}

#[async_trait]
impl SessionRepository for InMemorySessions {
    async fn get_all(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.lock().unwrap().values().cloned().collect())
    }

    async fn create(&self, session: Session) -> Result<()> {
        self.sessions.lock().unwrap().insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id).ok_or_else(|| session_not_found(id))?;
        session.status = status;
        Ok(())
    }

    async fn update_jid(&self, id: &str, jid: &Jid) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id).ok_or_else(|| session_not_found(id))?;
        session.jid = Some(jid.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.lock().unwrap().remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDevices {
    devices: Mutex<HashMap<String, Device>>,
    push_names: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl DeviceStore for InMemoryDevices {
    async fn get_all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.lock().unwrap().values().cloned().collect())
    }

    async fn new_device(&self, session_id: &str) -> Result<Device> {
        let device = Device { session_id: session_id.to_string(), jid: None };
        self.devices.lock().unwrap().insert(session_id.to_string(), device.clone());
        Ok(device)
    }

    async fn put_push_name(&self, jid: &Jid, push_name: &str) -> Result<()> {
        self.push_names.lock().unwrap().insert(jid.clone(), push_name.to_string());
        Ok(())
    }

    async fn get_contact(&self, jid: &Jid) -> Result<Option<String>> {
        Ok(self.push_names.lock().unwrap().get(jid).cloned())
    }

    async fn get_pn_for_lid(&self, _lid: &Jid) -> Result<Option<Jid>> {
        // No LID/phone-number mapping without a real companion device store.
        Ok(None)
    }
}

#[derive(Default)]
pub struct InMemoryEventRepository {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn write(&self, event: &Event) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubMediaStorage;

#[async_trait]
impl wa_gateway_core::protocol::MediaStorage for StubMediaStorage {
    fn max_bytes(&self) -> u64 {
        16 * 1024 * 1024
    }

    async fn store(
        &self,
        _session_id: &str,
        message_id: &str,
        _mimetype: &str,
        extension: &str,
        _plaintext: Vec<u8>,
    ) -> Result<StoredMedia> {
        Ok(StoredMedia {
            path: format!("/media/{message_id}{extension}"),
            public_url: format!("https://cdn.example.invalid/{message_id}{extension}"),
        })
    }
}

/// A protocol client with no real backing connection. It accepts
/// `connect`/`disconnect` and reports itself connected, but never produces
/// inbound events, QR codes, or message deliveries — a placeholder for the
/// real protocol-client library a deployment links in.
pub struct StubProtocolClient {
    session_id: String,
}

impl StubProtocolClient {
    pub fn new(session_id: &str) -> Self {
        Self { session_id: session_id.to_string() }
    }
}

#[async_trait]
impl ProtocolClient for StubProtocolClient {
    async fn connect(&self) -> Result<()> {
        tracing::debug!(session_id = %self.session_id, "stub protocol client connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send_message(&self, _jid: &Jid, _envelope: OutboundEnvelope) -> Result<()> {
        Err(Error::ConnectionFailed("no protocol client library configured".to_string()))
    }

    async fn upload(&self, _bytes: Vec<u8>, _kind: MediaKind) -> Result<UploadDescriptor> {
        Err(Error::MediaUploadFailed("no protocol client library configured".to_string()))
    }

    async fn download(&self, _media_url: &str, _media_key: &[u8]) -> Result<Vec<u8>> {
        Err(Error::MediaDownloadFailed("no protocol client library configured".to_string()))
    }

    fn get_qr_channel(&self) -> mpsc::Receiver<QrEvent> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    fn event_stream(&self) -> mpsc::Receiver<ProtocolEvent> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    async fn mark_read(&self, _message_ids: &[String], _chat_jid: &Jid, _sender_jid: &Jid) -> Result<()> {
        Ok(())
    }

    async fn send_presence(&self, _presence: Presence) -> Result<()> {
        Ok(())
    }

    async fn send_chat_presence(&self, _jid: &Jid, _presence: Presence) -> Result<()> {
        Ok(())
    }

    async fn get_joined_groups(&self) -> Result<Vec<RawGroup>> {
        Err(Error::ConnectionFailed("no protocol client library configured".to_string()))
    }
}
