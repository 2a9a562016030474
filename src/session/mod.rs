//! Owns per-session protocol clients: pairing, reconnection, JID mapping,
//! and event dispatch into the fan-out wiring. `clients`, `session_to_jid`,
//! and `handlers` are guarded together by one read/write lock, matching the
//! single-lock requirement this core is built around.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event_queue::EventQueue;
use crate::fanout::FanoutWiring;
use crate::history::{HistoryBatch, HistoryConfig, HistoryConversation, HistoryHandler, HistoryMessage};
use crate::media;
use crate::message;
use crate::model::{Event, EventType, Group, GroupMember, Session, SessionStatus};
use crate::protocol::{
    session_not_found, DeviceStore, MediaStorage, Presence, ProtocolClient, ProtocolEvent,
    QrEvent, ReceiptKind, SessionRepository,
};
use crate::retry::RetryPolicy;

fn jid_user_part(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

struct State {
    clients: HashMap<String, Arc<dyn ProtocolClient>>,
    session_to_jid: HashMap<String, String>,
}

pub struct SessionManager {
    state: RwLock<State>,
    config: SessionConfig,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,
    devices: Arc<dyn DeviceStore>,
    sessions: Arc<dyn SessionRepository>,
    events: Arc<FanoutWiring>,
    media_storage: Arc<dyn MediaStorage>,
    history: Arc<HistoryHandler>,
    history_config: HistoryConfig,
    /// Buffers events for a session between its `ConnectionDisconnected`
    /// dispatch and its next successful `connect`, flushed there in order.
    event_queue: EventQueue,
    connect_factory: Box<dyn Fn(&str) -> Arc<dyn ProtocolClient> + Send + Sync>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryPolicy>,
        devices: Arc<dyn DeviceStore>,
        sessions: Arc<dyn SessionRepository>,
        events: Arc<FanoutWiring>,
        media_storage: Arc<dyn MediaStorage>,
        history_config: HistoryConfig,
        connect_factory: Box<dyn Fn(&str) -> Arc<dyn ProtocolClient> + Send + Sync>,
    ) -> Self {
        let history = Arc::new(HistoryHandler::new(devices.clone(), events.clone()));
        Self {
            state: RwLock::new(State {
                clients: HashMap::new(),
                session_to_jid: HashMap::new(),
            }),
            config,
            breaker,
            retry,
            devices,
            sessions,
            events,
            media_storage,
            history,
            history_config,
            event_queue: EventQueue::new(),
            connect_factory,
        }
    }

    /// Idempotent: returns immediately if a connected handle already exists.
    /// Spawns the per-session inbound-event classification loop described at
    /// the top of this module on every fresh connect.
    pub async fn connect(self: &Arc<Self>, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        {
            let state = self.state.read().await;
            if let Some(client) = state.clients.get(session_id) {
                if client.is_connected() {
                    return Ok(());
                }
            }
        }

        self.ensure_device_record(session_id).await;

        let client = (self.connect_factory)(session_id);
        let client_for_call = client.clone();
        self.breaker
            .call(|| async {
                self.retry
                    .execute(cancel, || {
                        let client = client_for_call.clone();
                        async move { client.connect().await }
                    })
                    .await
            })
            .await?;

        let mut state = self.state.write().await;
        state.clients.insert(session_id.to_string(), client.clone());
        drop(state);

        for event in self.event_queue.flush(session_id) {
            self.events.publish(event).await;
        }

        if let Ok(devices) = self.devices.get_all_devices().await {
            if let Some(jid) = devices.into_iter().find(|d| d.session_id == session_id).and_then(|d| d.jid) {
                self.state.write().await.session_to_jid.insert(session_id.to_string(), jid.clone());
                let _ = self.sessions.update_jid(session_id, &jid).await;
            }
        }

        let this = Arc::clone(self);
        let session_id = session_id.to_string();
        let event_rx = client.event_stream();
        tokio::spawn(async move {
            this.run_event_loop(session_id, event_rx).await;
        });

        Ok(())
    }

    /// Locates the device record this session binds to before a fresh
    /// connect: by the prior JID mapping, else by a device whose JID's user
    /// part matches `session_id`, else creates one.
    async fn ensure_device_record(&self, session_id: &str) {
        let prior_jid = self.state.read().await.session_to_jid.get(session_id).cloned();
        let devices = self.devices.get_all_devices().await.unwrap_or_default();
        let found = devices.iter().any(|d| {
            prior_jid.as_deref().is_some_and(|jid| d.jid.as_deref() == Some(jid))
                || d.jid.as_deref().is_some_and(|jid| jid_user_part(jid) == session_id)
        });
        if !found {
            if let Err(e) = self.devices.new_device(session_id).await {
                tracing::warn!(session_id, error = %e, "failed to create device record before connect");
            }
        }
    }

    /// Classifies each item off a connected client's event stream and fans
    /// it out. Runs until the client drops its sender (disconnect/replace).
    async fn run_event_loop(self: Arc<Self>, session_id: String, mut event_rx: mpsc::Receiver<ProtocolEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                ProtocolEvent::Message { chat_jid, info, envelope } => {
                    let mut normalized = message::parse(&session_id, &info, &envelope);
                    normalized.chat_jid = chat_jid;
                    normalized.sender_jid = self.resolve_jid(&normalized.sender_jid).await;
                    if let Ok(client) = self.connected_client(&session_id).await {
                        media::process_media(&mut normalized, client.as_ref(), self.media_storage.as_ref()).await;
                    }
                    self.dispatch(
                        &session_id,
                        EventType::MessageReceived,
                        serde_json::to_value(&normalized).unwrap_or(serde_json::json!({})),
                    )
                    .await;
                }
                ProtocolEvent::Connected => {
                    self.dispatch(&session_id, EventType::ConnectionConnected, serde_json::json!({})).await;
                }
                ProtocolEvent::Disconnected => {
                    self.dispatch(&session_id, EventType::ConnectionDisconnected, serde_json::json!({})).await;
                }
                ProtocolEvent::LoggedOut => {
                    self.dispatch(&session_id, EventType::ConnectionLoggedOut, serde_json::json!({})).await;
                    return;
                }
                ProtocolEvent::Receipt { kind, message_ids, chat_jid } => {
                    let event_type = match kind {
                        ReceiptKind::Delivered => EventType::MessageDelivered,
                        ReceiptKind::Read => EventType::MessageRead,
                    };
                    self.dispatch(
                        &session_id,
                        event_type,
                        serde_json::json!({ "message_ids": message_ids, "chat_jid": chat_jid }),
                    )
                    .await;
                }
                ProtocolEvent::Presence { jid, presence } => {
                    self.dispatch(
                        &session_id,
                        EventType::PresenceUpdate,
                        serde_json::json!({ "jid": jid, "presence": format!("{presence:?}") }),
                    )
                    .await;
                }
                ProtocolEvent::HistorySync(raw_conversations) => {
                    let batch = HistoryBatch {
                        conversations: raw_conversations
                            .into_iter()
                            .map(|c| HistoryConversation {
                                chat_jid: c.chat_jid,
                                display_name: c.display_name,
                                messages: c
                                    .messages
                                    .into_iter()
                                    .map(|m| HistoryMessage { info: m.info, envelope: m.envelope, timestamp: m.timestamp })
                                    .collect(),
                            })
                            .collect(),
                    };
                    self.history.ingest(&session_id, &self.history_config, batch).await;
                }
            }
        }
    }

    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.remove(session_id) else {
            return Err(session_not_found(session_id));
        };
        drop(state);
        client.disconnect().await
    }

    /// Initiates a pairing attempt and streams QR/terminal events, applying a
    /// total `qr_timeout`.
    pub async fn get_qr_channel(&self, session_id: &str) -> Result<mpsc::Receiver<QrEvent>> {
        let state = self.state.read().await;
        let client = state.clients.get(session_id).cloned().ok_or_else(|| session_not_found(session_id))?;
        drop(state);

        let (tx, rx) = mpsc::channel(8);
        let timeout = self.config.qr_timeout;
        tokio::spawn(async move {
            let mut upstream = client.get_qr_channel();
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        let _ = tx.send(QrEvent::Timeout).await;
                        return;
                    }
                    event = upstream.recv() => {
                        match event {
                            Some(ev) => {
                                let terminal = matches!(ev, QrEvent::Authenticated { .. } | QrEvent::Timeout | QrEvent::Error { .. });
                                let _ = tx.send(ev).await;
                                if terminal {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Enumerates persisted sessions with a bound JID and reconnects each.
    pub async fn auto_reconnect(self: &Arc<Self>, cancel: &CancellationToken) -> HashMap<String, Error> {
        let mut errors = HashMap::new();
        let persisted = match self.sessions.get_all().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to enumerate persisted sessions for auto-reconnect");
                return errors;
            }
        };
        for session in persisted {
            let Some(jid) = session.jid.clone() else { continue };
            {
                let mut state = self.state.write().await;
                state.session_to_jid.insert(session.id.clone(), jid);
            }
            if let Err(e) = self.connect(&session.id, cancel).await {
                errors.insert(session.id, e);
            }
        }
        errors
    }

    async fn connected_client(&self, session_id: &str) -> Result<Arc<dyn ProtocolClient>> {
        let state = self.state.read().await;
        let client = state.clients.get(session_id).cloned().ok_or_else(|| session_not_found(session_id))?;
        if !client.is_connected() {
            return Err(Error::Disconnected(session_id.to_string()));
        }
        Ok(client)
    }

    /// Hands out the same connected client `send_presence`/`mark_read` use
    /// internally, for a caller (the outbound pipeline registry) that needs
    /// to build its own per-session worker against it.
    pub async fn client_for(&self, session_id: &str) -> Result<Arc<dyn ProtocolClient>> {
        self.connected_client(session_id).await
    }

    /// `chat_jid` is only meaningful for `Typing`/`Paused`: when set, it also
    /// drives the protocol's chat-scoped presence pair alongside the
    /// general one.
    pub async fn send_presence(
        &self,
        session_id: &str,
        presence: Presence,
        chat_jid: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self.connected_client(session_id).await?;
        self.breaker
            .call(|| async {
                self.retry
                    .execute(cancel, || {
                        let client = client.clone();
                        let presence = presence.clone();
                        async move { client.send_presence(presence).await }
                    })
                    .await
            })
            .await?;

        if let Some(chat_jid) = chat_jid {
            if matches!(presence, Presence::Typing | Presence::Paused) {
                let chat_jid = chat_jid.to_string();
                self.breaker
                    .call(|| async {
                        self.retry
                            .execute(cancel, || {
                                let client = client.clone();
                                let chat_jid = chat_jid.clone();
                                let presence = presence.clone();
                                async move { client.send_chat_presence(&chat_jid, presence).await }
                            })
                            .await
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// Validates the session is connected and sends a reaction envelope for
    /// `message_id` targeting `jid`; an empty `emoji` removes the reaction.
    pub async fn send_reaction(
        &self,
        session_id: &str,
        jid: &str,
        message_id: &str,
        emoji: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self.connected_client(session_id).await?;
        let jid = jid.to_string();
        let envelope = serde_json::json!({
            "reaction": { "text": emoji, "key": { "id": message_id } }
        });
        self.breaker
            .call(|| async {
                self.retry
                    .execute(cancel, || {
                        let client = client.clone();
                        let jid = jid.clone();
                        let envelope = envelope.clone();
                        async move { client.send_message(&jid, envelope).await }
                    })
                    .await
            })
            .await
    }

    pub async fn mark_read(
        &self,
        session_id: &str,
        message_ids: &[String],
        chat_jid: &str,
        sender_jid: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self.connected_client(session_id).await?;
        let chat_jid = chat_jid.to_string();
        let sender_jid = sender_jid.to_string();
        let message_ids = message_ids.to_vec();
        self.breaker
            .call(|| async {
                self.retry
                    .execute(cancel, || {
                        let client = client.clone();
                        let chat_jid = chat_jid.clone();
                        let sender_jid = sender_jid.clone();
                        let message_ids = message_ids.clone();
                        async move { client.mark_read(&message_ids, &chat_jid, &sender_jid).await }
                    })
                    .await
            })
            .await
    }

    /// Lists the groups this session has joined, with each participant's JID
    /// resolved past any ephemeral LID and its display name attached from the
    /// contact store.
    pub async fn get_joined_groups(&self, session_id: &str) -> Result<Vec<Group>> {
        let client = self.connected_client(session_id).await?;
        let raw_groups = client.get_joined_groups().await?;
        let mut groups = Vec::with_capacity(raw_groups.len());
        for g in raw_groups {
            let mut participants = Vec::with_capacity(g.participants.len());
            for p in g.participants {
                let jid = self.resolve_jid(&p.jid).await;
                let display_name = self.devices.get_contact(&jid).await.ok().flatten();
                participants.push(GroupMember { jid, display_name, is_admin: p.is_admin });
            }
            groups.push(Group { jid: g.jid, name: g.name, participants });
        }
        Ok(groups)
    }

    /// Resolves an ephemeral LID to its stable JID when the device store
    /// knows the mapping; otherwise keeps the LID unchanged.
    pub async fn resolve_jid(&self, jid: &str) -> String {
        if !jid.ends_with("@lid") {
            return jid.to_string();
        }
        match self.devices.get_pn_for_lid(&jid.to_string()).await {
            Ok(Some(resolved)) => resolved,
            _ => jid.to_string(),
        }
    }

    /// Classifies one protocol-originated event for `session_id` and fans it
    /// out through the registered handler list. Called off the state lock.
    /// While the session has no live connected client, events are buffered
    /// instead of published and replayed in order on the next `connect`.
    pub async fn dispatch(&self, session_id: &str, event_type: EventType, payload: serde_json::Value) {
        if event_type == EventType::ConnectionLoggedOut {
            let mut state = self.state.write().await;
            state.clients.remove(session_id);
        }

        let event = Event::new(event_type, session_id, payload);
        let connected = self
            .state
            .read()
            .await
            .clients
            .get(session_id)
            .is_some_and(|c| c.is_connected());
        if connected {
            self.events.publish(event).await;
        } else {
            self.event_queue.enqueue(event);
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.state.read().await.clients.keys().cloned().collect()
    }

    /// Snapshot for the (out-of-scope) health/metrics collaborator: how many
    /// registered clients report themselves connected right now.
    pub async fn health(&self) -> SessionManagerHealth {
        let state = self.state.read().await;
        let connected = state.clients.values().filter(|c| c.is_connected()).count();
        SessionManagerHealth {
            total: state.clients.len(),
            connected,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionManagerHealth {
    pub total: usize,
    pub connected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::model::Session as SessionRecord;
    use crate::protocol::{Device, MediaKind, OutboundEnvelope, StoredMedia, UploadDescriptor};
    use crate::retry::RetryConfig;
    use async_trait::async_trait;

    struct FakeClient;

    #[async_trait]
    impl ProtocolClient for FakeClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn send_message(&self, _jid: &String, _envelope: OutboundEnvelope) -> Result<()> {
            Ok(())
        }
        async fn upload(&self, _bytes: Vec<u8>, _kind: MediaKind) -> Result<UploadDescriptor> {
            unimplemented!()
        }
        async fn download(&self, _media_url: &str, _media_key: &[u8]) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn get_qr_channel(&self) -> mpsc::Receiver<QrEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
        fn event_stream(&self) -> mpsc::Receiver<crate::protocol::ProtocolEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
        async fn mark_read(&self, _ids: &[String], _chat: &String, _sender: &String) -> Result<()> {
            Ok(())
        }
        async fn send_presence(&self, _p: Presence) -> Result<()> {
            Ok(())
        }
        async fn send_chat_presence(&self, _jid: &String, _p: Presence) -> Result<()> {
            Ok(())
        }
        async fn get_joined_groups(&self) -> Result<Vec<crate::protocol::RawGroup>> {
            Ok(vec![])
        }
    }

    struct FakeDevices;
    #[async_trait]
    impl DeviceStore for FakeDevices {
        async fn get_all_devices(&self) -> Result<Vec<Device>> {
            Ok(vec![])
        }
        async fn new_device(&self, session_id: &str) -> Result<Device> {
            Ok(Device { session_id: session_id.to_string(), jid: None })
        }
        async fn put_push_name(&self, _jid: &String, _push_name: &str) -> Result<()> {
            Ok(())
        }
        async fn get_contact(&self, _jid: &String) -> Result<Option<String>> {
            Ok(None)
        }
        async fn get_pn_for_lid(&self, _lid: &String) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct FakeSessions;
    #[async_trait]
    impl SessionRepository for FakeSessions {
        async fn get_all(&self) -> Result<Vec<SessionRecord>> {
            Ok(vec![])
        }
        async fn create(&self, _s: SessionRecord) -> Result<()> {
            Ok(())
        }
        async fn update_status(&self, _id: &str, _status: SessionStatus) -> Result<()> {
            Ok(())
        }
        async fn update_jid(&self, _id: &str, _jid: &str) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeMediaStorage;
    #[async_trait]
    impl MediaStorage for FakeMediaStorage {
        fn max_bytes(&self) -> u64 {
            u64::MAX
        }
        async fn store(
            &self,
            _session_id: &str,
            _message_id: &str,
            _mimetype: &str,
            _extension: &str,
            _plaintext: Vec<u8>,
        ) -> Result<crate::protocol::StoredMedia> {
            unimplemented!()
        }
    }

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            SessionConfig {
                qr_timeout: Duration::from_millis(50),
                reconnect_delay: Duration::from_secs(1),
                max_reconnects: 3,
            },
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(RetryPolicy::new(RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..Default::default()
            })),
            Arc::new(FakeDevices),
            Arc::new(FakeSessions),
            Arc::new(FanoutWiring::new()),
            Arc::new(FakeMediaStorage),
            crate::history::HistoryConfig { enabled: false, full_sync: true, since: None },
            Box::new(|_session_id| Arc::new(FakeClient)),
        ))
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        mgr.connect("s1", &cancel).await.unwrap();
        mgr.connect("s1", &cancel).await.unwrap();
        assert_eq!(mgr.session_ids().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_unknown_session_is_not_found() {
        let mgr = manager();
        let err = mgr.disconnect("missing").await.unwrap_err();
        assert_eq!(err.code(), "session-not-found");
    }

    #[tokio::test]
    async fn send_presence_requires_connection() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let err = mgr.send_presence("never-connected", Presence::Online, None, &cancel).await.unwrap_err();
        assert_eq!(err.code(), "session-not-found");
    }

    #[tokio::test]
    async fn send_reaction_requires_connection() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let err = mgr.send_reaction("never-connected", "1@s.whatsapp.net", "m1", "👍", &cancel).await.unwrap_err();
        assert_eq!(err.code(), "session-not-found");
    }

    #[tokio::test]
    async fn send_reaction_succeeds_when_connected() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        mgr.connect("s1", &cancel).await.unwrap();
        mgr.send_reaction("s1", "1@s.whatsapp.net", "m1", "👍", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn get_joined_groups_requires_connection() {
        let mgr = manager();
        let err = mgr.get_joined_groups("never-connected").await.unwrap_err();
        assert_eq!(err.code(), "session-not-found");
    }

    #[tokio::test]
    async fn get_joined_groups_returns_empty_for_fake_client() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        mgr.connect("s1", &cancel).await.unwrap();
        assert!(mgr.get_joined_groups("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_jid_passes_through_non_lid() {
        let mgr = manager();
        assert_eq!(mgr.resolve_jid("123@s.whatsapp.net").await, "123@s.whatsapp.net");
    }

    #[tokio::test]
    async fn health_reports_connected_count() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        assert_eq!(mgr.health().await.total, 0);
        mgr.connect("s1", &cancel).await.unwrap();
        let health = mgr.health().await;
        assert_eq!(health.total, 1);
        assert_eq!(health.connected, 1);
    }

    #[tokio::test]
    async fn logged_out_dispatch_removes_client() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        mgr.connect("s1", &cancel).await.unwrap();
        mgr.dispatch("s1", EventType::ConnectionLoggedOut, serde_json::json!({})).await;
        assert!(mgr.session_ids().await.is_empty());
    }

    struct RecordingHandler {
        seen: Arc<tokio::sync::Mutex<Vec<EventType>>>,
    }

    #[async_trait]
    impl crate::fanout::EventHandler for RecordingHandler {
        async fn handle(&self, event: &Event) {
            self.seen.lock().await.push(event.event_type);
        }
        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[tokio::test]
    async fn dispatch_buffers_while_disconnected_and_flushes_on_connect() {
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut fanout = FanoutWiring::new();
        fanout.register(Arc::new(RecordingHandler { seen: seen.clone() }));

        let mgr = Arc::new(SessionManager::new(
            SessionConfig {
                qr_timeout: Duration::from_millis(50),
                reconnect_delay: Duration::from_secs(1),
                max_reconnects: 3,
            },
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(RetryPolicy::new(RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..Default::default()
            })),
            Arc::new(FakeDevices),
            Arc::new(FakeSessions),
            Arc::new(fanout),
            Arc::new(FakeMediaStorage),
            crate::history::HistoryConfig { enabled: false, full_sync: true, since: None },
            Box::new(|_session_id| Arc::new(FakeClient)),
        ));

        mgr.dispatch("s1", EventType::PresenceUpdate, serde_json::json!({})).await;
        mgr.dispatch("s1", EventType::MessageReceived, serde_json::json!({})).await;
        assert!(seen.lock().await.is_empty());

        let cancel = CancellationToken::new();
        mgr.connect("s1", &cancel).await.unwrap();

        let flushed = seen.lock().await.clone();
        assert_eq!(flushed, vec![EventType::PresenceUpdate, EventType::MessageReceived]);
    }
}
