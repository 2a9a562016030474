use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wa_gateway_core::breaker::CircuitBreaker;
use wa_gateway_core::config::Config;
use wa_gateway_core::fanout::{CompositeHandler, EventHandler, FanoutWiring, PersistenceSink, SessionStatusSink};
use wa_gateway_core::hub::EventHub;
use wa_gateway_core::model::Event;
use wa_gateway_core::outbound::OutboundRegistry;
use wa_gateway_core::history::HistoryConfig;
use wa_gateway_core::protocol::{DeviceStore, MediaStorage, ProtocolClient, SessionRepository, TracingAuditLog};
use wa_gateway_core::retry::RetryPolicy;
use wa_gateway_core::session::SessionManager;
use wa_gateway_core::uplink::UplinkPublisher;
use wa_gateway_core::webhook::WebhookDispatcher;

// In-memory stand-ins for the external collaborators (the real protocol
// client library, a database-backed SessionRepository/EventRepository, disk
// or object-store-backed MediaStorage). A real deployment supplies its own
// crate implementing these traits; this crate never depends on one.
mod collaborators;

use collaborators::{InMemoryDevices, InMemoryEventRepository, InMemorySessions, StubMediaStorage, StubProtocolClient};

#[derive(Clone)]
struct HealthState {
    hub: Arc<EventHub>,
    sessions: Arc<SessionManager>,
    outbound: Arc<OutboundRegistry>,
    breaker: Arc<CircuitBreaker>,
    uplink: Option<Arc<UplinkPublisher>>,
}

async fn healthz(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let session_health = state.sessions.health().await;
    let mut outbound_counters = HashMap::new();
    for id in state.outbound.session_ids() {
        if let Some(c) = state.outbound.counters(&id) {
            outbound_counters.insert(id, serde_json::json!({ "sent": c.sent, "failed": c.failed }));
        }
    }
    Json(serde_json::json!({
        "sessions": { "total": session_health.total, "connected": session_health.connected },
        "hub": { "clients": state.hub.client_count(), "evictions": state.hub.eviction_count() },
        "breaker_trips": state.breaker.trip_count(),
        "outbound": outbound_counters,
        "uplink": state.uplink.as_ref().map(|u| serde_json::json!({
            "connected": u.is_connected(),
            "reconnects": u.reconnect_count(),
        })),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting wa-gateway-core");

    let config = Config::from_env();

    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let retry = Arc::new(RetryPolicy::new(wa_gateway_core::retry::RetryConfig {
        max_attempts: config.outbound.max_retries,
        ..Default::default()
    }));

    let sessions_repo: Arc<dyn SessionRepository> = Arc::new(InMemorySessions::default());
    let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDevices::default());
    let media_storage: Arc<dyn MediaStorage> = Arc::new(StubMediaStorage::default());
    let event_repo = Arc::new(InMemoryEventRepository::default());
    let audit = Arc::new(TracingAuditLog);

    let hub = EventHub::new(config.hub.clone());
    let uplink = if config.uplink.url.is_empty() {
        None
    } else {
        Some(Arc::new(UplinkPublisher::start(
            config.uplink.clone(),
            config.session.reconnect_delay,
            config.session.max_reconnects,
        )))
    };
    let webhook = if config.webhook.enabled {
        Some(Arc::new(WebhookDispatcher::new(
            config.webhook.url.clone(),
            config.webhook.secret.clone(),
            config.webhook.events.clone(),
            std::time::Duration::from_secs(10),
            audit.clone(),
        )))
    } else {
        None
    };

    let mut fanout = FanoutWiring::new();
    fanout.register(hub.clone());
    let uplink_handler: Arc<dyn EventHandler> = match &uplink {
        Some(u) => u.clone(),
        None => Arc::new(NullUplinkHandler),
    };
    let webhook_handler: Option<Arc<dyn EventHandler>> = webhook
        .as_ref()
        .map(|w| w.clone() as Arc<dyn EventHandler>);
    fanout.register(Arc::new(CompositeHandler::new(uplink_handler, webhook_handler)));
    fanout.register(Arc::new(PersistenceSink::new(
        event_repo.clone(),
        config.events_enabled,
        ["message.received", "message.sent", "message.failed"].into_iter().collect(),
    )));
    fanout.register(Arc::new(SessionStatusSink::new(sessions_repo.clone())));
    let events = Arc::new(fanout);

    let history_config = HistoryConfig {
        enabled: config.history.enabled,
        full_sync: config.history.full_sync,
        since: config.history.since,
    };

    let session_manager = Arc::new(SessionManager::new(
        config.session.clone(),
        breaker.clone(),
        retry.clone(),
        devices,
        sessions_repo,
        events.clone(),
        media_storage,
        history_config,
        Box::new(|session_id: &str| Arc::new(StubProtocolClient::new(session_id)) as Arc<dyn ProtocolClient>),
    ));

    let outbound = Arc::new(OutboundRegistry::new(
        config.outbound.clone(),
        2,
        breaker.clone(),
        retry.clone(),
        events.clone(),
    ));

    let cancel = CancellationToken::new();
    let reconnect_errors = session_manager.auto_reconnect(&cancel).await;
    for (session_id, err) in &reconnect_errors {
        tracing::warn!(session_id, error = %err, "auto-reconnect failed for persisted session");
    }
    for session_id in session_manager.session_ids().await {
        if let Ok(client) = session_manager.client_for(&session_id).await {
            outbound.spawn_for(&session_id, client).await;
        }
    }

    let health_state = HealthState {
        hub: hub.clone(),
        sessions: session_manager.clone(),
        outbound: outbound.clone(),
        breaker: breaker.clone(),
        uplink: uplink.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(health_state)
        .merge(hub.clone().router());

    let bind_addr = std::env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown order: outbound workers, then the uplink publisher (best-effort
    // flush), then the hub (dropped with its Arc below), then sessions.
    tracing::info!("shutdown signal received, draining outbound workers");
    match Arc::try_unwrap(outbound) {
        Ok(registry) => registry.shutdown().await,
        Err(_) => tracing::warn!("outbound registry still has outstanding references, skipping drain"),
    }

    if let Some(uplink) = uplink {
        tracing::info!("flushing uplink publisher");
        match Arc::try_unwrap(uplink) {
            Ok(uplink) => uplink.shutdown(std::time::Duration::from_secs(5)).await,
            Err(_) => tracing::warn!("uplink publisher still has outstanding references, skipping flush"),
        }
    }

    drop(hub);

    tracing::info!("disconnecting sessions");
    for session_id in session_manager.session_ids().await {
        if let Err(e) = session_manager.disconnect(&session_id).await {
            tracing::warn!(session_id, error = %e, "error disconnecting session during shutdown");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

struct NullUplinkHandler;

#[async_trait::async_trait]
impl EventHandler for NullUplinkHandler {
    async fn handle(&self, _event: &Event) {}
    fn name(&self) -> &'static str {
        "uplink-disabled"
    }
}
