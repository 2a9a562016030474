use std::time::Duration;

use chrono::{DateTime, Utc};

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Recognized configuration options. Everything else (HTTP listener
/// address, DB DSN, CORS, admin API-key CRUD) belongs to the out-of-scope
/// collaborators and is not modeled here.
#[derive(Debug, Clone)]
pub struct Config {
    pub session: SessionConfig,
    pub outbound: OutboundConfig,
    pub breaker: BreakerConfig,
    pub uplink: UplinkConfig,
    pub hub: HubConfig,
    pub webhook: WebhookConfig,
    pub history: HistoryConfig,
    pub events_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub qr_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnects: u32,
}

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Converted from the per-minute env value; always ≥ 1.
    pub rate_limit_per_second: f64,
    pub queue_size: usize,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_requests_half_open: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub url: String,
    pub api_key: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub api_key: String,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub auth_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub full_sync: bool,
    pub since: Option<DateTime<Utc>>,
}

impl Config {
    pub fn from_env() -> Self {
        let message_rate_limit_per_min: f64 = env_parse("OUTBOUND_MESSAGE_RATE_LIMIT", 30.0);
        Self {
            session: SessionConfig {
                qr_timeout: env_duration_secs("SESSION_QR_TIMEOUT_SECS", 120),
                reconnect_delay: env_duration_secs("SESSION_RECONNECT_DELAY_SECS", 5),
                max_reconnects: env_parse("SESSION_MAX_RECONNECTS", 10),
            },
            outbound: OutboundConfig {
                rate_limit_per_second: (message_rate_limit_per_min / 60.0).max(1.0),
                queue_size: env_parse("OUTBOUND_QUEUE_SIZE", 1000),
                max_retries: env_parse("OUTBOUND_MAX_RETRIES", 3),
            },
            breaker: BreakerConfig {
                max_requests_half_open: env_parse("BREAKER_MAX_REQUESTS_HALF_OPEN", 3),
                interval: env_duration_secs("BREAKER_INTERVAL_SECS", 60),
                timeout: env_duration_secs("BREAKER_TIMEOUT_SECS", 30),
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
                success_threshold: env_parse("BREAKER_SUCCESS_THRESHOLD", 2),
            },
            uplink: UplinkConfig {
                url: env_string("UPLINK_URL", ""),
                api_key: env_string("UPLINK_API_KEY", ""),
                ping_interval: env_duration_secs("UPLINK_PING_INTERVAL_SECS", 30),
                pong_timeout: env_duration_secs("UPLINK_PONG_TIMEOUT_SECS", 10),
                queue_size: env_parse("UPLINK_QUEUE_SIZE", 1000),
            },
            hub: HubConfig {
                api_key: env_string("HUB_API_KEY", ""),
                ping_interval: env_duration_secs("HUB_PING_INTERVAL_SECS", 30),
                write_timeout: env_duration_secs("HUB_WRITE_TIMEOUT_SECS", 10),
                auth_timeout: env_duration_secs("HUB_AUTH_TIMEOUT_SECS", 10),
            },
            webhook: WebhookConfig {
                enabled: env_parse("WEBHOOK_ENABLED", false),
                url: env_string("WEBHOOK_URL", ""),
                secret: env_string("WEBHOOK_SECRET", ""),
                events: std::env::var("WEBHOOK_EVENTS")
                    .ok()
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
            },
            history: HistoryConfig {
                enabled: env_parse("HISTORY_SYNC_ENABLED", false),
                full_sync: env_parse("HISTORY_FULL_SYNC", true),
                since: std::env::var("HISTORY_SYNC_SINCE")
                    .ok()
                    .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            },
            events_enabled: env_parse("EVENTS_ENABLED", false),
        }
    }
}
