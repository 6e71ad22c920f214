//! Duplex transport abstraction.
//!
//! Higher layers never branch on WebSocket vs. XHR-polling; they hold a
//! `Box<dyn Transport>` and call `send`/`recv`/`close`. Both variants carry
//! periodic heartbeats; a missed heartbeat beyond `disconnect_delay` closes
//! the connection and the `Kite` peer emits a disconnect event.

pub mod websocket;
pub mod xhr;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Which transport to dial with. `Auto` tries WebSocket first and falls
/// back to XHR-polling if the handshake fails, the same fallback browsers
/// need when a proxy blocks raw WebSocket upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Auto,
    WebSocket,
    XHRPolling,
}

impl TransportKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Auto" => Some(Self::Auto),
            "WebSocket" => Some(Self::WebSocket),
            "XHRPolling" => Some(Self::XHRPolling),
            _ => None,
        }
    }
}

/// Heartbeat policy shared by both transport variants.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Connection is closed if no heartbeat (inbound or outbound) is seen
    /// within this window. Default 10s.
    pub disconnect_delay: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            disconnect_delay: Duration::from_secs(10),
        }
    }
}

/// A single ordered, reliable framed duplex byte stream. Implementations own
/// their own background I/O; `send`/`recv` never block on a reconnect.
/// Reconnection is explicitly not a transport concern, and is handled by
/// the Kontrol client / pool dial loops instead.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<()>;
    /// Returns `None` when the peer closed the connection. Implementations
    /// serialize concurrent callers internally (a single reader task is
    /// expected in practice, but the trait does not assume it).
    async fn recv(&self) -> Result<Option<String>>;
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds() {
        assert_eq!(TransportKind::parse("WebSocket"), Some(TransportKind::WebSocket));
        assert_eq!(TransportKind::parse("XHRPolling"), Some(TransportKind::XHRPolling));
        assert_eq!(TransportKind::parse("bogus"), None);
    }
}
