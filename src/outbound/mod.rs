//! Outbound send pipeline: validates requests, paces them against a
//! token bucket, and drives each send through the circuit breaker wrapping
//! the retry policy wrapping the protocol client's send call.

mod pacer;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::OutboundConfig;
use crate::error::{Error, Result};
use crate::fanout::FanoutWiring;
use crate::model::{Event, EventType, OutboundKind};
use crate::protocol::{session_not_found, MediaKind, ProtocolClient};
use crate::retry::RetryPolicy;

pub use pacer::TokenBucket;

/// One send request accepted from a caller. `to` is an E.164 phone number;
/// JID construction is this module's job, not the caller's.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_id: String,
    pub to: String,
    pub kind: OutboundKind,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media_bytes: Option<Vec<u8>>,
}

fn validate_e164(raw: &str) -> Result<String> {
    let digits = raw
        .strip_prefix('+')
        .ok_or_else(|| Error::InvalidPhone(raw.to_string()))?;
    if digits.is_empty() || digits.len() > 15 || digits.len() < 2 {
        return Err(Error::InvalidPhone(raw.to_string()));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) || digits.starts_with('0') {
        return Err(Error::InvalidPhone(raw.to_string()));
    }
    Ok(digits.to_string())
}

fn recipient_jid(digits: &str) -> String {
    format!("{digits}@s.whatsapp.net")
}

fn kind_to_media(kind: OutboundKind) -> Option<MediaKind> {
    match kind {
        OutboundKind::Text => None,
        OutboundKind::Image => Some(MediaKind::Image),
        OutboundKind::Document => Some(MediaKind::Document),
        OutboundKind::Audio => Some(MediaKind::Audio),
        OutboundKind::Video => Some(MediaKind::Video),
    }
}

fn build_envelope(
    kind: OutboundKind,
    text: Option<&str>,
    caption: Option<&str>,
    upload: Option<&crate::protocol::UploadDescriptor>,
) -> serde_json::Value {
    match kind {
        OutboundKind::Text => serde_json::json!({ "conversation": text.unwrap_or_default() }),
        _ => {
            let upload = upload.expect("media kinds always carry an upload descriptor here");
            let key = format!("{}media", kind_key(kind));
            let mut body = serde_json::json!({
                "url": upload.url,
                "mediaKey": STANDARD.encode(&upload.media_key),
                "fileSHA256": upload.file_sha256,
                "fileLength": upload.file_length,
            });
            if let Some(caption) = caption {
                body["caption"] = serde_json::json!(caption);
            }
            serde_json::json!({ key: body })
        }
    }
}

fn kind_key(kind: OutboundKind) -> &'static str {
    match kind {
        OutboundKind::Text => "",
        OutboundKind::Image => "image",
        OutboundKind::Document => "document",
        OutboundKind::Audio => "audio",
        OutboundKind::Video => "video",
    }
}

struct WorkItem {
    message_id: String,
    session_id: String,
    jid: String,
    kind: OutboundKind,
    text: Option<String>,
    caption: Option<String>,
    media_bytes: Option<Vec<u8>>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

/// Snapshot of in-process send counters, for the (out-of-scope) health/metrics
/// collaborator to poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundCounters {
    pub sent: u64,
    pub failed: u64,
}

pub struct OutboundPipeline {
    tx: mpsc::Sender<WorkItem>,
    cancel: CancellationToken,
    queue_len: Arc<AtomicUsize>,
    sent: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl OutboundPipeline {
    pub fn new(
        config: &OutboundConfig,
        workers: usize,
        client: Arc<dyn ProtocolClient>,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryPolicy>,
        events: Arc<FanoutWiring>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let cancel = CancellationToken::new();
        let queue_len = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let pacer = Arc::new(TokenBucket::new(config.rate_limit_per_second));

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let cancel = cancel.clone();
            let queue_len = queue_len.clone();
            let sent = sent.clone();
            let failed = failed.clone();
            let client = client.clone();
            let breaker = breaker.clone();
            let retry = retry.clone();
            let events = events.clone();
            let pacer = pacer.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(rx, cancel, queue_len, sent, failed, client, breaker, retry, events, pacer).await;
            }));
        }

        Self {
            tx,
            cancel,
            queue_len,
            sent,
            failed,
            handles,
        }
    }

    /// `(pending_id, err)`: validates and enqueues, returning before the send
    /// is attempted.
    pub async fn send_async(&self, request: SendRequest) -> Result<String> {
        let item = self.prepare(request, None)?;
        let message_id = item.message_id.clone();
        self.enqueue(item).await?;
        Ok(message_id)
    }

    /// `(final_status, err)`: validates, enqueues, and waits for the worker
    /// to report the terminal outcome.
    pub async fn send_sync(&self, request: SendRequest) -> Result<()> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let item = self.prepare(request, Some(completion_tx))?;
        self.enqueue(item).await?;
        completion_rx.await.unwrap_or_else(|_| Err(Error::cancelled()))
    }

    fn prepare(
        &self,
        request: SendRequest,
        completion: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<WorkItem> {
        let digits = validate_e164(&request.to)?;
        if matches!(request.kind, OutboundKind::Text)
            && request.text.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(Error::EmptyContent);
        }
        if !matches!(request.kind, OutboundKind::Text) && request.media_bytes.is_none() {
            return Err(Error::MediaUploadFailed("no media payload provided".into()));
        }
        Ok(WorkItem {
            message_id: Uuid::new_v4().to_string(),
            session_id: request.session_id,
            jid: recipient_jid(&digits),
            kind: request.kind,
            text: request.text,
            caption: request.caption,
            media_bytes: request.media_bytes,
            completion,
        })
    }

    async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.queue_len.fetch_sub(1, Ordering::SeqCst);
                Err(Error::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queue_len.fetch_sub(1, Ordering::SeqCst);
                Err(Error::cancelled())
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> OutboundCounters {
        OutboundCounters {
            sent: self.sent.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    pub async fn close(self) {
        self.cancel.cancel();
        drop(self.tx);
        for h in self.handles {
            let _ = h.await;
        }
    }
}

/// Owns one [`OutboundPipeline`] per connected session. Sessions connect and
/// disconnect independently, so each gets its own queue, token bucket, and
/// worker pool rather than sharing one pipeline bound to a single client.
pub struct OutboundRegistry {
    config: OutboundConfig,
    workers_per_session: usize,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,
    events: Arc<FanoutWiring>,
    pipelines: DashMap<String, OutboundPipeline>,
}

impl OutboundRegistry {
    pub fn new(
        config: OutboundConfig,
        workers_per_session: usize,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryPolicy>,
        events: Arc<FanoutWiring>,
    ) -> Self {
        Self {
            config,
            workers_per_session,
            breaker,
            retry,
            events,
            pipelines: DashMap::new(),
        }
    }

    /// Starts (or restarts) the pipeline backing `session_id` against its
    /// freshly connected client. Replaces and closes any prior pipeline for
    /// the same session first, in case of a reconnect.
    pub async fn spawn_for(&self, session_id: &str, client: Arc<dyn ProtocolClient>) {
        let pipeline = OutboundPipeline::new(
            &self.config,
            self.workers_per_session,
            client,
            self.breaker.clone(),
            self.retry.clone(),
            self.events.clone(),
        );
        if let Some((_, old)) = self.pipelines.remove(session_id) {
            old.close().await;
        }
        self.pipelines.insert(session_id.to_string(), pipeline);
    }

    /// Tears down and removes the pipeline for a disconnected session, if any.
    pub async fn remove(&self, session_id: &str) {
        if let Some((_, pipeline)) = self.pipelines.remove(session_id) {
            pipeline.close().await;
        }
    }

    pub async fn send_async(&self, request: SendRequest) -> Result<String> {
        let session_id = request.session_id.clone();
        let pipeline = self
            .pipelines
            .get(&session_id)
            .ok_or_else(|| session_not_found(&session_id))?;
        pipeline.send_async(request).await
    }

    pub async fn send_sync(&self, request: SendRequest) -> Result<()> {
        let session_id = request.session_id.clone();
        let pipeline = self
            .pipelines
            .get(&session_id)
            .ok_or_else(|| session_not_found(&session_id))?;
        pipeline.send_sync(request).await
    }

    pub fn counters(&self, session_id: &str) -> Option<OutboundCounters> {
        self.pipelines.get(session_id).map(|p| p.counters())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.pipelines.iter().map(|e| e.key().clone()).collect()
    }

    /// Closes every live pipeline, draining each worker pool in turn.
    pub async fn shutdown(self) {
        for (_, pipeline) in self.pipelines.into_iter() {
            pipeline.close().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    rx: Arc<AsyncMutex<mpsc::Receiver<WorkItem>>>,
    cancel: CancellationToken,
    queue_len: Arc<AtomicUsize>,
    sent: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    client: Arc<dyn ProtocolClient>,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,
    events: Arc<FanoutWiring>,
    pacer: Arc<TokenBucket>,
) {
    loop {
        let item = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = guard.recv() => item,
            }
        };
        let Some(item) = item else {
            break;
        };
        queue_len.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = pacer.acquire(&cancel).await {
            notify(item.completion, Err(e));
            continue;
        }

        let result = send_one(&client, &breaker, &retry, &cancel, &item).await;
        let event = match &result {
            Ok(()) => {
                sent.fetch_add(1, Ordering::SeqCst);
                Event::new(
                    EventType::MessageSent,
                    item.session_id.clone(),
                    serde_json::json!({ "message_id": item.message_id, "to": item.jid }),
                )
            }
            Err(e) => {
                failed.fetch_add(1, Ordering::SeqCst);
                Event::new(
                    EventType::MessageFailed,
                    item.session_id.clone(),
                    serde_json::json!({ "message_id": item.message_id, "to": item.jid, "error": e.code() }),
                )
            }
        };
        events.publish(event).await;
        notify(item.completion, result);
    }
}

fn notify(completion: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(tx) = completion {
        let _ = tx.send(result);
    }
}

async fn send_one(
    client: &Arc<dyn ProtocolClient>,
    breaker: &Arc<CircuitBreaker>,
    retry: &Arc<RetryPolicy>,
    cancel: &CancellationToken,
    item: &WorkItem,
) -> Result<()> {
    let upload = if let Some(media_kind) = kind_to_media(item.kind) {
        let bytes = item
            .media_bytes
            .clone()
            .ok_or_else(|| Error::MediaUploadFailed("no media payload provided".into()))?;
        Some(client.upload(bytes, media_kind).await.map_err(|e| {
            Error::MediaUploadFailed(e.to_string())
        })?)
    } else {
        None
    };
    let envelope = build_envelope(item.kind, item.text.as_deref(), item.caption.as_deref(), upload.as_ref());

    breaker
        .call(|| async {
            retry
                .execute(cancel, || {
                    let client = client.clone();
                    let jid = item.jid.clone();
                    let envelope = envelope.clone();
                    async move { client.send_message(&jid, envelope).await }
                })
                .await
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::protocol::{Device, OutboundEnvelope, Presence, QrEvent, UploadDescriptor};
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct FakeClient {
        fail_sends: AtomicU32,
    }

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
            if self.fail_sends.load(Ordering::SeqCst) > 0 {
                self.fail_sends.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::ConnectionFailed("simulated".into()));
            }
            Ok(())
        }
        async fn upload(&self, _bytes: Vec<u8>, _kind: MediaKind) -> Result<UploadDescriptor> {
            Ok(UploadDescriptor {
                url: "https://upload.example.com/x".into(),
                media_key: vec![1, 2, 3],
                file_sha256: "abc".into(),
                file_length: 3,
            })
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
            unimplemented!()
        }
    }
    #[allow(dead_code)]
    fn unused_device() -> Device {
        Device {
            session_id: "s".into(),
            jid: None,
        }
    }

    fn pipeline(client: Arc<FakeClient>) -> OutboundPipeline {
        let config = OutboundConfig {
            rate_limit_per_second: 1000.0,
            queue_size: 4,
            max_retries: 3,
        };
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let retry = Arc::new(RetryPolicy::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }));
        OutboundPipeline::new(&config, 1, client, breaker, retry, Arc::new(FanoutWiring::new()))
    }

    #[test]
    fn validates_e164() {
        assert_eq!(validate_e164("+12025550123").unwrap(), "12025550123");
        assert!(validate_e164("12025550123").is_err());
        assert!(validate_e164("+0123").is_err());
        assert!(validate_e164("+1abc").is_err());
    }

    #[test]
    fn builds_recipient_jid() {
        assert_eq!(recipient_jid("12025550123"), "12025550123@s.whatsapp.net");
    }

    #[tokio::test]
    async fn send_sync_succeeds_for_valid_text_request() {
        let client = Arc::new(FakeClient { fail_sends: AtomicU32::new(0) });
        let pipeline = pipeline(client);
        let result = pipeline
            .send_sync(SendRequest {
                session_id: "s1".into(),
                to: "+12025550123".into(),
                kind: OutboundKind::Text,
                text: Some("hello".into()),
                caption: None,
                media_bytes: None,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(pipeline.counters().sent, 1);
        assert_eq!(pipeline.counters().failed, 0);
        pipeline.close().await;
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected_before_enqueue() {
        let client = Arc::new(FakeClient { fail_sends: AtomicU32::new(0) });
        let pipeline = pipeline(client);
        let err = pipeline
            .send_async(SendRequest {
                session_id: "s1".into(),
                to: "not-a-phone".into(),
                kind: OutboundKind::Text,
                text: Some("hi".into()),
                caption: None,
                media_bytes: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid-phone");
        assert_eq!(pipeline.queue_size(), 0);
        pipeline.close().await;
    }

    #[tokio::test]
    async fn media_request_without_bytes_is_rejected() {
        let client = Arc::new(FakeClient { fail_sends: AtomicU32::new(0) });
        let pipeline = pipeline(client);
        let err = pipeline
            .send_async(SendRequest {
                session_id: "s1".into(),
                to: "+12025550123".into(),
                kind: OutboundKind::Image,
                text: None,
                caption: None,
                media_bytes: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "media-upload-failed");
        pipeline.close().await;
    }

    fn registry() -> OutboundRegistry {
        OutboundRegistry::new(
            OutboundConfig {
                rate_limit_per_second: 1000.0,
                queue_size: 4,
                max_retries: 3,
            },
            1,
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(RetryPolicy::new(RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            })),
            Arc::new(FanoutWiring::new()),
        )
    }

    #[tokio::test]
    async fn registry_routes_by_session_and_rejects_unknown() {
        let reg = registry();
        let err = reg
            .send_sync(SendRequest {
                session_id: "s1".into(),
                to: "+12025550123".into(),
                kind: OutboundKind::Text,
                text: Some("hi".into()),
                caption: None,
                media_bytes: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "session-not-found");

        reg.spawn_for("s1", Arc::new(FakeClient { fail_sends: AtomicU32::new(0) })).await;
        assert_eq!(reg.session_ids(), vec!["s1".to_string()]);
        let result = reg
            .send_sync(SendRequest {
                session_id: "s1".into(),
                to: "+12025550123".into(),
                kind: OutboundKind::Text,
                text: Some("hi".into()),
                caption: None,
                media_bytes: None,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(reg.counters("s1").unwrap().sent, 1);

        reg.remove("s1").await;
        assert!(reg.counters("s1").is_none());
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let client = Arc::new(FakeClient { fail_sends: AtomicU32::new(1) });
        let pipeline = pipeline(client);
        let result = pipeline
            .send_sync(SendRequest {
                session_id: "s1".into(),
                to: "+12025550123".into(),
                kind: OutboundKind::Text,
                text: Some("hello".into()),
                caption: None,
                media_bytes: None,
            })
            .await;
        assert!(result.is_ok());
        pipeline.close().await;
    }
}
