//! Proxy-side bookkeeping for every private kite currently registered.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use kite::keys::KeyPair;
use kite::peer::Connection;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::Config;

/// One private kite's control connection plus its outstanding tunnels.
/// `tunnels` holds a sender per tunnel id waiting for the private kite's
/// second connection (the one it opens in response to `kite.tunnel`) to
/// show up on `/tunnel`.
pub struct PrivateKite {
    pub id: Uuid,
    pub conn: Arc<Connection>,
    pub tunnels: DashMap<u64, oneshot::Sender<WebSocket>>,
    pub next_seq: AtomicU64,
}

pub struct ProxyState {
    pub kites: DashMap<Uuid, Arc<PrivateKite>>,
    pub signing_keys: KeyPair,
    pub config: Config,
}
