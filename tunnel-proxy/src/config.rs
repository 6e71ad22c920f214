//! tunnel-proxy configuration, all from environment variables.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for both the control channel and the public tunnel
    /// endpoints.
    pub listen_addr: String,
    /// Public base URL advertised to private kites in `register`'s
    /// response, e.g. `https://proxy.example.com`.
    pub public_base_url: String,
    /// How long a `kite.tunnel` call is allowed to take before the external
    /// caller is told the tunnel failed to establish.
    pub tunnel_call_timeout: Duration,
    /// How long a tunnel id may sit unclaimed before it is abandoned.
    pub tunnel_abandon_after: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:4100".into());
        Self {
            public_base_url: env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| format!("ws://{listen_addr}")),
            listen_addr,
            tunnel_call_timeout: env::var("TUNNEL_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(4)),
            tunnel_abandon_after: env::var("TUNNEL_ABANDON_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "tunnel_proxy=info,tower_http=info".into()),
        }
    }
}
