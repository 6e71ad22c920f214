//! The two public tunnel endpoints: `/proxy` (external callers) and
//! `/tunnel` (the private kite's half of the bridge), plus the raw
//! byte-copy loop that joins them. Neither endpoint decodes dnode frames;
//! the proxy only ever sees bytes, exactly like any other TCP relay.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use kite::keys::token;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::state::{PrivateKite, ProxyState};

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    #[serde(rename = "kiteID")]
    pub kite_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    pub token: String,
}

/// GET /proxy?kiteID=..., an external caller asking to reach a private
/// kite. Upgrades immediately; the actual handshake with the private kite
/// happens after, inside the upgrade callback, so a slow or failed
/// handshake never blocks the HTTP response.
pub async fn proxy_handler(
    Query(params): Query<ProxyQuery>,
    State(state): State<Arc<ProxyState>>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ProxyError> {
    let kite_id = Uuid::parse_str(&params.kite_id).map_err(|_| ProxyError::UnknownKite(params.kite_id.clone()))?;
    let private = state
        .kites
        .get(&kite_id)
        .map(|e| Arc::clone(e.value()))
        .ok_or_else(|| ProxyError::UnknownKite(params.kite_id.clone()))?;

    Ok(ws.on_upgrade(move |external| async move {
        if let Err(e) = bridge_to_private_kite(state, private, external).await {
            warn!(kite = %kite_id, "tunnel failed: {e}");
        }
    }))
}

/// GET /tunnel?token=..., the private kite reconnecting in response to a
/// `kite.tunnel` call. Hands its socket off to whichever `/proxy` request
/// is waiting on this tunnel id and returns; the bridging task owns the
/// socket from here.
pub async fn tunnel_handler(
    Query(params): Query<TunnelQuery>,
    State(state): State<Arc<ProxyState>>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ProxyError> {
    let claims = token::verify_tunnel_token(&params.token, &state.signing_keys.public_pem)
        .map_err(|e| ProxyError::BadToken(e.to_string()))?;
    let kite_id = Uuid::parse_str(&claims.sub).map_err(|_| ProxyError::BadToken("malformed subject".into()))?;
    let private = state.kites.get(&kite_id).map(|e| Arc::clone(e.value())).ok_or(ProxyError::UnknownTunnel)?;
    let sender = private
        .tunnels
        .remove(&claims.seq)
        .map(|(_, tx)| tx)
        .ok_or(ProxyError::UnknownTunnel)?;

    Ok(ws.on_upgrade(move |private_socket| async move {
        let _ = sender.send(private_socket);
    }))
}

async fn bridge_to_private_kite(state: Arc<ProxyState>, private: Arc<PrivateKite>, external: WebSocket) -> Result<(), ProxyError> {
    let seq = private.next_seq.fetch_add(1, Ordering::Relaxed);
    let tunnel_token = token::mint_tunnel_token(&private.id.to_string(), seq, &state.signing_keys)?;

    let (tx, rx) = oneshot::channel();
    private.tunnels.insert(seq, tx);

    let tunnel_url = format!("{}/tunnel?token={tunnel_token}", state.config.public_base_url);
    if let Err(e) = private
        .conn
        .call("kite.tunnel", vec![serde_json::json!({ "url": tunnel_url })], state.config.tunnel_call_timeout)
        .await
    {
        private.tunnels.remove(&seq);
        return Err(e.into());
    }

    let private_socket = match tokio::time::timeout(state.config.tunnel_abandon_after, rx).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(_)) | Err(_) => {
            private.tunnels.remove(&seq);
            return Err(ProxyError::TunnelTimedOut);
        }
    };

    copy_both_ways(external, private_socket).await;
    Ok(())
}

/// Bridges two already-upgraded WebSockets until either side closes or
/// errors. Neither direction interprets the bytes it forwards.
async fn copy_both_ways(a: WebSocket, b: WebSocket) {
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();

    let a_to_b = async {
        while let Some(Ok(msg)) = a_rx.next().await {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
            if b_tx.send(msg).await.is_err() {
                break;
            }
        }
    };
    let b_to_a = async {
        while let Some(Ok(msg)) = b_rx.next().await {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
            if a_tx.send(msg).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = a_to_b => {}
        _ = b_to_a => {}
    }
}
