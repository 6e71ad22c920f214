//! kontrold configuration, all from environment variables.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for WebSocket + REST.
    pub listen_addr: String,
    /// Default per-entry TTL; refreshed on every heartbeat.
    pub entry_ttl: Duration,
    /// Owners must heartbeat within `2 * heartbeat_interval` or be
    /// deregistered.
    pub heartbeat_interval: Duration,
    /// Access token lifetime.
    pub token_ttl: Duration,
    /// Log level filter.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".into()),
            entry_ttl: env::var("KONTROL_ENTRY_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
            heartbeat_interval: env::var("KONTROL_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
            token_ttl: env::var("KONTROL_TOKEN_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(3600)),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "kontrold=info,tower_http=info".into()),
        }
    }
}
