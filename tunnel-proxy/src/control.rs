//! The control channel: `register`, and cleanup on disconnect.
//!
//! A private kite dials the proxy and calls `register` once; everything
//! else (the actual tunneling) happens over separate connections the proxy
//! and the private kite open to each other later, driven by `/proxy` and
//! `/tunnel`.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use kite::peer::{Connection, Kite, RequestContext};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::state::{PrivateKite, ProxyState};

pub async fn install_methods(kite: &Arc<Kite>, state: Arc<ProxyState>) {
    let s = Arc::clone(&state);
    kite.handle_func_no_auth(
        "register",
        Arc::new(move |ctx: RequestContext, args: Vec<JsonValue>, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_register(&s, ctx, args).await })
        }),
    );

    let cleanup_state = Arc::clone(&state);
    kite.on_disconnect(Arc::new(move |conn: Arc<Connection>| {
        let state = Arc::clone(&cleanup_state);
        tokio::spawn(async move {
            state.kites.retain(|_, private| private.conn.id != conn.id);
        });
    }))
    .await;
}

async fn handle_register(state: &ProxyState, ctx: RequestContext, args: Vec<JsonValue>) -> kite::Result<JsonValue> {
    let kite_id = args
        .first()
        .and_then(|v| v.get("kiteID"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| kite::KiteError::Protocol("register: missing kiteID".into()))?;
    let kite_id = Uuid::parse_str(kite_id).map_err(|e| kite::KiteError::Protocol(format!("register: bad kiteID: {e}")))?;

    let conn = ctx
        .connection
        .clone()
        .ok_or_else(|| kite::KiteError::Internal("register: no connection in context".into()))?;

    let private = Arc::new(PrivateKite {
        id: kite_id,
        conn,
        tunnels: DashMap::new(),
        next_seq: AtomicU64::new(1),
    });
    state.kites.insert(kite_id, private);

    let url = format!("{}/proxy?kiteID={kite_id}", state.config.public_base_url);
    Ok(serde_json::json!({ "url": url }))
}
