//! tunnel-proxy, public rendezvous for kites behind NAT.
//!
//! A private kite dials `/control` and calls `register` to get back a
//! public URL. External callers dial that URL (`/proxy?kiteID=...`); the
//! proxy asks the private kite to open a second connection to
//! `/tunnel?token=...` and bridges the two raw byte streams together.

mod config;
mod control;
mod error;
mod state;
mod tunnel;

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use kite::identity::Identity;
use kite::keys::KeyPair;
use kite::peer::Kite;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::state::ProxyState;
use crate::tunnel::{proxy_handler, tunnel_handler};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("tunnel-proxy starting");
    info!(listen = %config.listen_addr, base_url = %config.public_base_url);

    let signing_keys = KeyPair::generate().expect("failed to generate tunnel-proxy signing keypair");

    let state = Arc::new(ProxyState {
        kites: dashmap::DashMap::new(),
        signing_keys,
        config: config.clone(),
    });

    let identity = Identity {
        username: "tunnel-proxy".to_string(),
        environment: "production".to_string(),
        name: "tunnel-proxy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        region: "default".to_string(),
        hostname: kite::Config::hostname(),
        id: Uuid::new_v4(),
    };
    let kite = Kite::new(identity, kite::Config::from_env());
    control::install_methods(&kite, Arc::clone(&state)).await;

    let control_routes = Router::new().route("/control", get(control_handler)).with_state(kite);

    let tunnel_routes = Router::new()
        .route("/proxy", get(proxy_handler))
        .route("/tunnel", get(tunnel_handler))
        .with_state(Arc::clone(&state));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(control_routes)
        .merge(tunnel_routes)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "tunnel-proxy listening");

    axum::serve(listener, app).await.expect("server error");
}

async fn control_handler(ws: WebSocketUpgrade, State(kite): State<Arc<Kite>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { kite.accept(socket).await })
}

async fn healthz() -> &'static str {
    "ok"
}
