//! WebSocket transport, the preferred variant.
//!
//! Two flavors share one `Transport` impl shape: the client flavor dials out
//! with `tokio-tungstenite` (used by the Kontrol client, the pool, and any
//! kite calling a peer), the server flavor wraps an already-upgraded `axum`
//! socket (used by `kontrold`, `tunnel-proxy`, and any kite accepting an
//! inbound call). Both track the last time *any* frame was seen and rely on
//! a companion heartbeat task to close the connection if that goes stale.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket as AxumWebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

use super::{HeartbeatConfig, Transport};
use crate::error::{KiteError, Result};

fn now_millis() -> i64 {
    // Millisecond clock via a monotonic-ish wall clock read. Used only to
    // compare against a heartbeat window, never persisted or compared across
    // processes, so clock skew does not matter here.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn is_stale(last_seen: &AtomicI64, cfg: &HeartbeatConfig) -> bool {
    now_millis() - last_seen.load(Ordering::Relaxed) > cfg.disconnect_delay.as_millis() as i64
}

/// Client-dialed WebSocket transport.
pub struct WsClientTransport {
    sink: Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungsteniteMessage>>>,
    stream: Mutex<SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>>,
    last_seen: Arc<AtomicI64>,
    stale_notify: Arc<Notify>,
}

impl WsClientTransport {
    pub async fn dial(url: &str) -> Result<Self> {
        let (stream, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| KiteError::Transport(format!("connect {url}: {e}")))?;
        let (sink, stream) = stream.split();
        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            stream: Mutex::new(stream),
            last_seen: Arc::new(AtomicI64::new(now_millis())),
            stale_notify: Arc::new(Notify::new()),
        })
    }

    /// Spawn the background heartbeat: pings on `interval`, and once
    /// `last_seen` falls more than `disconnect_delay` behind, wakes any
    /// blocked `recv` so the connection is torn down the same way an
    /// ordinary peer-initiated close is.
    pub fn spawn_heartbeat(&self, cfg: HeartbeatConfig) {
        let sink = Arc::clone(&self.sink);
        let last_seen = Arc::clone(&self.last_seen);
        let stale_notify = Arc::clone(&self.stale_notify);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.interval);
            loop {
                ticker.tick().await;
                if is_stale(&last_seen, &cfg) {
                    warn!("no frame seen within heartbeat window, closing connection");
                    let mut guard = sink.lock().await;
                    let _ = guard.send(TungsteniteMessage::Close(None)).await;
                    stale_notify.notify_waiters();
                    break;
                }
                let mut guard = sink.lock().await;
                if guard.send(TungsteniteMessage::Ping(Vec::new().into())).await.is_err() {
                    stale_notify.notify_waiters();
                    break;
                }
            }
        });
    }

    pub fn stale(&self, cfg: &HeartbeatConfig) -> bool {
        is_stale(&self.last_seen, cfg)
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn send(&self, frame: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        guard
            .send(TungsteniteMessage::Text(frame.into()))
            .await
            .map_err(|e| KiteError::Transport(format!("send: {e}")))
    }

    async fn recv(&self) -> Result<Option<String>> {
        let mut stream = self.stream.lock().await;
        loop {
            tokio::select! {
                _ = self.stale_notify.notified() => return Ok(None),
                next = stream.next() => match next {
                    Some(Ok(TungsteniteMessage::Text(text))) => {
                        self.last_seen.store(now_millis(), Ordering::Relaxed);
                        return Ok(Some(text.to_string()));
                    }
                    Some(Ok(TungsteniteMessage::Pong(_))) | Some(Ok(TungsteniteMessage::Ping(_))) => {
                        self.last_seen.store(now_millis(), Ordering::Relaxed);
                        continue;
                    }
                    Some(Ok(TungsteniteMessage::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("websocket recv error: {e}");
                        return Ok(None);
                    }
                },
            }
        }
    }

    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        let _ = guard.send(TungsteniteMessage::Close(None)).await;
    }
}

/// Server-accepted WebSocket transport (an already-upgraded `axum` socket).
pub struct WsServerTransport {
    sink: Arc<Mutex<SplitSink<AxumWebSocket, AxumMessage>>>,
    stream: Mutex<SplitStream<AxumWebSocket>>,
    last_seen: Arc<AtomicI64>,
    stale_notify: Arc<Notify>,
}

impl WsServerTransport {
    pub fn new(socket: AxumWebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Arc::new(Mutex::new(sink)),
            stream: Mutex::new(stream),
            last_seen: Arc::new(AtomicI64::new(now_millis())),
            stale_notify: Arc::new(Notify::new()),
        }
    }

    pub fn spawn_heartbeat(&self, cfg: HeartbeatConfig) {
        let sink = Arc::clone(&self.sink);
        let last_seen = Arc::clone(&self.last_seen);
        let stale_notify = Arc::clone(&self.stale_notify);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.interval);
            loop {
                ticker.tick().await;
                if is_stale(&last_seen, &cfg) {
                    warn!("no frame seen within heartbeat window, closing connection");
                    let mut guard = sink.lock().await;
                    let _ = guard.send(AxumMessage::Close(None)).await;
                    stale_notify.notify_waiters();
                    break;
                }
                let mut guard = sink.lock().await;
                if guard.send(AxumMessage::Ping(Vec::new().into())).await.is_err() {
                    stale_notify.notify_waiters();
                    break;
                }
            }
        });
    }

    pub fn stale(&self, cfg: &HeartbeatConfig) -> bool {
        is_stale(&self.last_seen, cfg)
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn send(&self, frame: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        guard
            .send(AxumMessage::Text(frame.into()))
            .await
            .map_err(|e| KiteError::Transport(format!("send: {e}")))
    }

    async fn recv(&self) -> Result<Option<String>> {
        let mut stream = self.stream.lock().await;
        loop {
            tokio::select! {
                _ = self.stale_notify.notified() => return Ok(None),
                next = stream.next() => match next {
                    Some(Ok(AxumMessage::Text(text))) => {
                        self.last_seen.store(now_millis(), Ordering::Relaxed);
                        return Ok(Some(text.to_string()));
                    }
                    Some(Ok(AxumMessage::Pong(_))) | Some(Ok(AxumMessage::Ping(_))) => {
                        self.last_seen.store(now_millis(), Ordering::Relaxed);
                        continue;
                    }
                    Some(Ok(AxumMessage::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("websocket recv error: {e}");
                        return Ok(None);
                    }
                },
            }
        }
    }

    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        let _ = guard.send(AxumMessage::Close(None)).await;
    }
}

/// Exponential backoff with jitter: `base * 1.6^attempt`, capped.
pub async fn backoff_sleep(attempt: u32, base: Duration, cap: Duration) {
    let factor = 1.6f64.powi(attempt as i32);
    let millis = (base.as_millis() as f64 * factor).min(cap.as_millis() as f64);
    let jitter = rand::random::<f64>() * millis * 0.5;
    tokio::time::sleep(Duration::from_millis((millis + jitter) as u64)).await;
}
