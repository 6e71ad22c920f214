//! Installs the Kontrol registry RPCs (`register`, `heartbeat`, `getKites`,
//! `watchKites`, `getToken`, `getPublicKey`, `registerMachine`) on a `Kite`
//! peer. Every inbound connection to kontrold speaks the same dnode
//! protocol a kite-to-kite connection does. Kontrol is just another kite
//! with a fixed set of built-in methods, backed by a pluggable storage
//! trait instead of a user-supplied handler table.

use std::sync::Arc;

use kite::identity::{Identity, Query, RegistryEntry};
use kite::keys::{token, KeyPair, KiteKey};
use kite::peer::{Kite, RequestContext};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::storage::{Backend, Event};

pub struct RegistryState {
    pub backend: Arc<dyn Backend>,
    pub signing_keys: KeyPair,
    pub config: Config,
    pub kontrol_url: String,
}

/// Registers the built-in Kontrol methods on `kite`. Every method except
/// `getPublicKey` and `registerMachine` requires authentication; a kite
/// always has a kite key (minted by `registerMachine` once, up front) even
/// before it holds its first access token, so the kite-key auth path
/// covers registration and lookups alike.
pub fn install_methods(kite: &Arc<Kite>, state: Arc<RegistryState>) {
    let s = Arc::clone(&state);
    kite.handle_func(
        "register",
        Arc::new(move |_ctx: RequestContext, args: Vec<JsonValue>, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_register(&s, args).await })
        }),
    );

    let s = Arc::clone(&state);
    kite.handle_func(
        "heartbeat",
        Arc::new(move |_ctx, args, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_heartbeat(&s, args).await })
        }),
    );

    let s = Arc::clone(&state);
    kite.handle_func(
        "getKites",
        Arc::new(move |_ctx, args, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_get_kites(&s, args).await })
        }),
    );

    let s = Arc::clone(&state);
    kite.handle_func(
        "watchKites",
        Arc::new(move |ctx, args, replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_watch_kites(&s, ctx, args, replier).await })
        }),
    );

    let s = Arc::clone(&state);
    kite.handle_func(
        "getToken",
        Arc::new(move |ctx, args, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_get_token(&s, ctx, args).await })
        }),
    );

    let s = Arc::clone(&state);
    kite.handle_func_no_auth(
        "getPublicKey",
        Arc::new(move |_ctx, _args, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { Ok(serde_json::json!({ "publicKey": s.signing_keys.public_pem })) })
        }),
    );

    let s = Arc::clone(&state);
    kite.handle_func_no_auth(
        "registerMachine",
        Arc::new(move |_ctx, args, _replier| {
            let s = Arc::clone(&s);
            Box::pin(async move { handle_register_machine(&s, args).await })
        }),
    );
}

async fn handle_register(state: &RegistryState, args: Vec<JsonValue>) -> kite::Result<JsonValue> {
    let identity: Identity = parse_arg(&args, 0, "identity")?;
    let url = args
        .get(1)
        .and_then(|v| v.get("url"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| kite::KiteError::Protocol("register: missing url".into()))?
        .to_string();

    let heartbeat_url = format!("/heartbeat/{}", identity.path().trim_start_matches('/'));
    let entry = RegistryEntry {
        identity,
        url,
        issued_at: chrono::Utc::now().timestamp(),
        heartbeat_url: heartbeat_url.clone(),
    };

    state
        .backend
        .upsert(entry, state.config.entry_ttl)
        .await
        .map_err(|e| kite::KiteError::Retryable(e.to_string()))?;

    Ok(serde_json::json!({
        "heartbeatURL": heartbeat_url,
        "interval": state.config.heartbeat_interval.as_millis() as u64,
    }))
}

async fn handle_heartbeat(state: &RegistryState, args: Vec<JsonValue>) -> kite::Result<JsonValue> {
    let path = args
        .first()
        .and_then(|v| v.get("url"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| kite::KiteError::Protocol("heartbeat: missing url".into()))?;
    let identity_path = path.trim_start_matches("/heartbeat");

    let existing = state
        .backend
        .list(&Query::parse_path(identity_path).ok_or_else(|| kite::KiteError::Protocol("malformed heartbeat path".into()))?)
        .await
        .map_err(|e| kite::KiteError::Retryable(e.to_string()))?;

    let Some(entry) = existing.into_iter().next() else {
        return Err(kite::KiteError::NotFound("no such registration".into()));
    };

    state
        .backend
        .upsert(entry, state.config.entry_ttl)
        .await
        .map_err(|e| kite::KiteError::Retryable(e.to_string()))?;

    Ok(JsonValue::Bool(true))
}

async fn handle_get_kites(state: &RegistryState, args: Vec<JsonValue>) -> kite::Result<JsonValue> {
    let query: Query = parse_arg(&args, 0, "query")?;
    let entries = state
        .backend
        .list(&query)
        .await
        .map_err(|e| kite::KiteError::Retryable(e.to_string()))?;
    serde_json::to_value(entries).map_err(kite::KiteError::Serialize)
}

async fn handle_watch_kites(
    state: &RegistryState,
    ctx: RequestContext,
    args: Vec<JsonValue>,
    replier: kite::peer::Replier,
) -> kite::Result<JsonValue> {
    let query: Query = parse_arg(&args, 0, "query")?;
    let callback_id = args
        .get(1)
        .and_then(|v| v.get("callbackId"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| kite::KiteError::Protocol("watchKites: missing callback".into()))?;
    let conn = ctx
        .connection
        .clone()
        .ok_or_else(|| kite::KiteError::Internal("watchKites: no connection in context".into()))?;

    let snapshot = state
        .backend
        .list(&query)
        .await
        .map_err(|e| kite::KiteError::Retryable(e.to_string()))?;
    let rx = state.backend.subscribe();
    let watcher = ctx.authenticated_username.clone().unwrap_or_else(|| "anonymous".to_string());

    info!(query = ?query, matches = snapshot.len(), "watchKites subscribed");

    // `watchKites` replies immediately with an ack; the snapshot and every
    // subsequent event are delivered asynchronously by invoking the
    // caller's installed callback. The initial snapshot is always
    // delivered before any subsequent event for the same query.
    replier.reply(JsonValue::Bool(true));

    tokio::spawn(forward_watch_events(
        Arc::clone(&state.backend),
        state.signing_keys.clone(),
        state.config.token_ttl,
        conn,
        callback_id,
        query,
        watcher,
        snapshot,
        rx,
    ));

    Ok(JsonValue::Bool(true))
}

/// Mints a token letting `watcher` call `entry` right away and attaches it
/// to the register event, so a watcher never has to make a separate
/// `getToken` round trip for kites it discovers this way.
fn register_event_payload(signing_keys: &KeyPair, token_ttl: std::time::Duration, watcher: &str, entry: &RegistryEntry) -> JsonValue {
    let token = token::mint_access_token(watcher, &entry.identity.path(), signing_keys, Some(token_ttl)).ok();
    serde_json::json!({ "event": "register", "entry": entry, "token": token })
}

#[allow(clippy::too_many_arguments)]
async fn forward_watch_events(
    backend: Arc<dyn Backend>,
    signing_keys: KeyPair,
    token_ttl: std::time::Duration,
    conn: Arc<kite::peer::Connection>,
    callback_id: u64,
    query: Query,
    watcher: String,
    snapshot: Vec<RegistryEntry>,
    mut rx: tokio::sync::broadcast::Receiver<Event>,
) {
    for entry in snapshot {
        let payload = register_event_payload(&signing_keys, token_ttl, &watcher, &entry);
        if conn.invoke_callback(callback_id, vec![payload]).await.is_err() {
            return;
        }
    }

    loop {
        match rx.recv().await {
            Ok(Event::Register(entry)) if query.matches(&entry.identity) => {
                let payload = register_event_payload(&signing_keys, token_ttl, &watcher, &entry);
                if conn.invoke_callback(callback_id, vec![payload]).await.is_err() {
                    return;
                }
            }
            Ok(Event::Deregister(identity)) if query.matches(&identity) => {
                let payload = serde_json::json!({ "event": "deregister", "entry": identity });
                if conn.invoke_callback(callback_id, vec![payload]).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(query = ?query, lagged = n, "watch lagged, resyncing from a fresh snapshot");
                match backend.list(&query).await {
                    Ok(entries) => {
                        for entry in entries {
                            let payload = register_event_payload(&signing_keys, token_ttl, &watcher, &entry);
                            if conn.invoke_callback(callback_id, vec![payload]).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(query = ?query, "watch resync failed ({e}), {}", crate::error::KontrolError::WatchExpired);
                        let payload = serde_json::json!({ "event": "watchExpired" });
                        let _ = conn.invoke_callback(callback_id, vec![payload]).await;
                        return;
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
        if conn.is_closed() {
            return;
        }
    }
}

async fn handle_get_token(state: &RegistryState, ctx: RequestContext, args: Vec<JsonValue>) -> kite::Result<JsonValue> {
    let callee_path = args
        .first()
        .and_then(|v| v.get("calleePath"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| kite::KiteError::Protocol("getToken: missing calleePath".into()))?;

    let caller = ctx
        .authenticated_username
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());

    let token = token::mint_access_token(&caller, callee_path, &state.signing_keys, Some(state.config.token_ttl))?;
    Ok(serde_json::json!({ "token": token }))
}

async fn handle_register_machine(state: &RegistryState, args: Vec<JsonValue>) -> kite::Result<JsonValue> {
    let username = args
        .first()
        .and_then(|v| v.get("username"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| kite::KiteError::Protocol("registerMachine: missing username".into()))?;

    let key = KiteKey::issue(username, &state.kontrol_url, &state.signing_keys)?;
    Ok(serde_json::json!({ "kiteKey": key.raw, "id": Uuid::new_v4().to_string() }))
}

fn parse_arg<T: serde::de::DeserializeOwned>(args: &[JsonValue], index: usize, name: &str) -> kite::Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| kite::KiteError::Protocol(format!("missing argument: {name}")))?;
    serde_json::from_value(value.clone()).map_err(|e| kite::KiteError::Protocol(format!("bad {name}: {e}")))
}

