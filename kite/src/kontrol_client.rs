//! Client for Kontrol's registry RPCs: registration with a heartbeat loop,
//! query-with-watch, and token fetches. Maintains its own dial-forever
//! coroutine so callers never see a disconnect, only a brief gap in
//! liveness.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::dnode::AuthInfo;
use crate::error::{KiteError, Result};
use crate::identity::{Identity, Query, RegistryEntry};
use crate::keys::token::KeyLookup;
use crate::keys::KiteKey;
use crate::peer::{connection, Connection};
use crate::transport::websocket::{backoff_sleep, WsClientTransport};
use crate::transport::HeartbeatConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResult {
    #[serde(rename = "heartbeatURL")]
    pub heartbeat_url: String,
    pub interval: u64,
}

/// A `Register`/`Deregister` event delivered to a `WatchKites` handler. A
/// `Register` carries a token freshly minted for this subscriber. `Expired`
/// ends the stream after an unrecoverable gap; the caller must re-issue
/// `watch_kites` to resume.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Register(RegistryEntry, Option<String>),
    Deregister(Identity),
    Expired,
}

/// Handle returned by `watch_kites`; dropping or calling `cancel` stops
/// delivery.
pub struct WatchHandle {
    cancel_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl WatchHandle {
    pub fn closed() -> Self {
        Self { cancel_tx: None }
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Maintains a connection to Kontrol, reconnecting with backoff whenever it
/// drops. Every public method blocks until a live connection is available
/// rather than failing fast, mirroring the "dial-forever" contract.
pub struct KontrolClient {
    kontrol_url: String,
    kite_key: KiteKey,
    conn: Arc<RwLock<Option<Arc<Connection>>>>,
}

impl KontrolClient {
    pub fn new(kontrol_url: impl Into<String>, kite_key: KiteKey) -> Arc<Self> {
        let client = Arc::new(Self {
            kontrol_url: kontrol_url.into(),
            kite_key,
            conn: Arc::new(RwLock::new(None)),
        });
        client.clone().spawn_dialer();
        client
    }

    fn spawn_dialer(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match WsClientTransport::dial(&self.kontrol_url).await {
                    Ok(transport) => {
                        attempt = 0;
                        transport.spawn_heartbeat(HeartbeatConfig::default());
                        let conn = Arc::new(Connection::new(Arc::new(transport)));
                        *self.conn.write().await = Some(Arc::clone(&conn));
                        info!(url = %self.kontrol_url, "connected to kontrol");
                        while !conn.is_closed() {
                            let msg = match conn.recv().await {
                                Ok(Some(msg)) => msg,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(url = %self.kontrol_url, "recv error: {e}");
                                    break;
                                }
                            };
                            match connection::classify(&msg) {
                                connection::MessageKind::Callback(id) => {
                                    if let Err(e) = conn.callbacks().dispatch(id, msg.arguments.clone()) {
                                        warn!(url = %self.kontrol_url, "{e}, closing kontrol connection");
                                        break;
                                    }
                                }
                                connection::MessageKind::MethodCall(method) => {
                                    warn!(url = %self.kontrol_url, "unexpected inbound call {method} from kontrol, ignoring");
                                }
                            }
                        }
                        conn.close().await;
                        *self.conn.write().await = None;
                        warn!(url = %self.kontrol_url, "kontrol connection lost, reconnecting");
                    }
                    Err(e) => {
                        warn!(url = %self.kontrol_url, "dial failed: {e}");
                    }
                }
                attempt += 1;
                backoff_sleep(attempt, Duration::from_millis(500), Duration::from_secs(30)).await;
            }
        });
    }

    async fn connection(&self) -> Arc<Connection> {
        loop {
            if let Some(conn) = self.conn.read().await.clone() {
                if !conn.is_closed() {
                    return conn;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn auth(&self) -> AuthInfo {
        AuthInfo {
            kind: "kiteKey".to_string(),
            key: self.kite_key.raw.clone(),
        }
    }

    /// Registers `url` with Kontrol and keeps heartbeating it until the
    /// caller drops the returned handle's last clone. Never returns Err; on
    /// disconnect it re-registers once the dial-forever loop reconnects.
    pub async fn register_forever(self: &Arc<Self>, identity: Identity, url: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let conn = this.connection().await;
                let args = vec![
                    serde_json::to_value(&identity).unwrap_or(JsonValue::Null),
                    serde_json::json!({ "url": url }),
                ];
                match conn
                    .call_with_auth("register", args, Duration::from_secs(15), Some(this.auth()))
                    .await
                    .and_then(|v| serde_json::from_value::<RegisterResult>(v).map_err(KiteError::Serialize))
                {
                    Ok(result) => {
                        this.heartbeat_loop(Arc::clone(&conn), result).await;
                    }
                    Err(e) => {
                        warn!("register failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                if conn.is_closed() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        });
    }

    async fn heartbeat_loop(&self, conn: Arc<Connection>, result: RegisterResult) {
        let interval = Duration::from_millis(result.interval.max(1000));
        while !conn.is_closed() {
            tokio::time::sleep(interval).await;
            if conn.is_closed() {
                break;
            }
            let outcome = conn
                .call_with_auth(
                    "heartbeat",
                    vec![serde_json::json!({ "url": result.heartbeat_url })],
                    Duration::from_secs(10),
                    Some(self.auth()),
                )
                .await;
            if let Err(e) = outcome {
                warn!("heartbeat failed: {e}");
                break;
            }
        }
    }

    pub async fn get_kites(&self, query: &Query) -> Result<Vec<RegistryEntry>> {
        let conn = self.connection().await;
        let value = conn
            .call_with_auth(
                "getKites",
                vec![serde_json::to_value(query)?],
                Duration::from_secs(15),
                Some(self.auth()),
            )
            .await?;
        serde_json::from_value(value).map_err(KiteError::Serialize)
    }

    /// Delivers the current snapshot, then every subsequent
    /// `Register`/`Deregister` event, on `tx`. The snapshot is always sent
    /// before any live event for the same query.
    pub async fn watch_kites(self: &Arc<Self>, query: Query, tx: mpsc::Sender<WatchEvent>) -> Result<WatchHandle> {
        let conn = self.connection().await;
        let snapshot = self.get_kites(&query).await?;
        for entry in snapshot {
            if tx.send(WatchEvent::Register(entry, None)).await.is_err() {
                return Ok(WatchHandle::closed());
            }
        }

        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel();
        let handler_tx = tx.clone();
        let placeholder = conn.install_callback(Arc::new(move |args| {
            let Some(event) = parse_watch_event(&args) else {
                return;
            };
            let _ = handler_tx.try_send(event);
        }));

        conn.notify_with_auth(
            "watchKites",
            vec![
                serde_json::to_value(&query)?,
                serde_json::json!({ "function": true, "callbackId": placeholder.callback_id }),
            ],
            Some(self.auth()),
        )
        .await?;

        tokio::spawn(async move {
            let _ = (&mut cancel_rx).await;
        });

        Ok(WatchHandle {
            cancel_tx: Some(cancel_tx),
        })
    }

    pub async fn get_token(&self, callee_path: &str) -> Result<String> {
        let conn = self.connection().await;
        let value = conn
            .call_with_auth(
                "getToken",
                vec![serde_json::json!({ "calleePath": callee_path })],
                Duration::from_secs(10),
                Some(self.auth()),
            )
            .await?;
        value
            .get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| KiteError::Protocol("getToken: missing token field".into()))
    }
}

fn parse_watch_event(args: &[JsonValue]) -> Option<WatchEvent> {
    let first = args.first()?;
    let kind = first.get("event")?.as_str()?;
    match kind {
        "watchExpired" => Some(WatchEvent::Expired),
        "register" => {
            let entry_value = first.get("entry")?.clone();
            let entry: RegistryEntry = serde_json::from_value(entry_value).ok()?;
            let token = first.get("token").and_then(|v| v.as_str()).map(str::to_string);
            Some(WatchEvent::Register(entry, token))
        }
        "deregister" => {
            let entry_value = first.get("entry")?.clone();
            let identity: Identity = serde_json::from_value(entry_value).ok()?;
            Some(WatchEvent::Deregister(identity))
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl KeyLookup for KontrolClient {
    async fn public_key_for(&self, username: &str) -> Result<String> {
        let conn = self.connection().await;
        let value = conn
            .call_with_auth(
                "getPublicKey",
                vec![serde_json::json!({ "username": username })],
                Duration::from_secs(10),
                Some(self.auth()),
            )
            .await?;
        value
            .get("publicKey")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| KiteError::NotFound(format!("no public key for {username}")))
    }
}
