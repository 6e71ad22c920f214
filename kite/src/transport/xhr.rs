//! SockJS-style XHR-polling transport, the fallback variant used where
//! WebSocket upgrades are blocked by an intermediate proxy.
//!
//! Framing is simpler than a real SockJS session: each poll is a `POST
//! {base}/xhr_send` for outbound frames and a long `GET {base}/xhr` that
//! blocks server-side until a frame is available or a poll timeout elapses.
//! `kite` only implements the client half; `kontrold`/`tunnel-proxy` accept
//! it behind the same `/ws` style route using the ordinary HTTP body instead
//! of an upgrade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::Transport;
use crate::error::{KiteError, Result};

pub struct XhrPollingTransport {
    client: reqwest::Client,
    base_url: String,
    inbound: Mutex<mpsc::Receiver<String>>,
    poll_interval: Duration,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl XhrPollingTransport {
    pub fn dial(base_url: &str) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let client = reqwest::Client::new();
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let poll_client = client.clone();
        let poll_url = format!("{base_url}/xhr");
        let poll_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while !poll_closed.load(std::sync::atomic::Ordering::Relaxed) {
                match poll_client.get(&poll_url).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        if let Ok(body) = resp.text().await {
                            if !body.is_empty() && tx.send(body).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });

        Self {
            client,
            base_url: base_url.to_string(),
            inbound: Mutex::new(rx),
            poll_interval: Duration::from_millis(500),
            closed,
        }
    }
}

#[async_trait]
impl Transport for XhrPollingTransport {
    async fn send(&self, frame: String) -> Result<()> {
        let url = format!("{}/xhr_send", self.base_url);
        self.client
            .post(&url)
            .body(frame)
            .send()
            .await
            .map_err(|e| KiteError::Transport(format!("xhr_send: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<String>> {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(None);
        }
        let mut rx = self.inbound.lock().await;
        tokio::time::timeout(self.poll_interval * 120, rx.recv())
            .await
            .map_err(|_| KiteError::Timeout)
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
