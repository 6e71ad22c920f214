//! Kite-side configuration, all from environment variables.

use std::env;
use std::time::Duration;

use crate::transport::TransportKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub environment: String,
    pub region: String,
    pub ip: String,
    pub port: u16,
    pub kontrol_url: String,
    pub transport: TransportKind,
    /// `Tell` default timeout.
    pub timeout: Duration,
    /// Transport handshake timeout.
    pub handshake_timeout: Duration,
    /// Token-verification cache TTL. `<= 0` disables caching.
    pub verify_ttl: Duration,
    pub verify_ttl_disabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let verify_ttl_secs: i64 = env::var("KITE_VERIFY_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Self {
            username: env::var("KITE_USERNAME").unwrap_or_else(|_| "anonymous".into()),
            environment: env::var("KITE_ENVIRONMENT").unwrap_or_else(|_| "development".into()),
            region: env::var("KITE_REGION").unwrap_or_else(|_| "default".into()),
            ip: env::var("KITE_IP").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("KITE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            kontrol_url: env::var("KITE_KONTROL_URL")
                .unwrap_or_else(|_| "ws://localhost:4000/kontrol".into()),
            transport: env::var("KITE_TRANSPORT")
                .ok()
                .and_then(|v| TransportKind::parse(&v))
                .unwrap_or(TransportKind::Auto),
            timeout: env::var("KITE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(15)),
            handshake_timeout: env::var("KITE_HANDSHAKE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
            verify_ttl: Duration::from_secs(verify_ttl_secs.max(0) as u64),
            verify_ttl_disabled: verify_ttl_secs <= 0,
        }
    }

    pub fn hostname() -> String {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_absent() {
        for var in [
            "KITE_USERNAME",
            "KITE_ENVIRONMENT",
            "KITE_REGION",
            "KITE_TIMEOUT",
            "KITE_VERIFY_TTL",
        ] {
            env::remove_var(var);
        }
        let config = Config::from_env();
        assert_eq!(config.username, "anonymous");
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert!(!config.verify_ttl_disabled);
    }

    #[test]
    fn verify_ttl_zero_or_negative_disables_caching() {
        env::set_var("KITE_VERIFY_TTL", "-1");
        let config = Config::from_env();
        assert!(config.verify_ttl_disabled);
        env::remove_var("KITE_VERIFY_TTL");
    }
}
