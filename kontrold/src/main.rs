//! kontrold, the Kite registry.
//!
//! Speaks the same dnode-over-WebSocket protocol any kite speaks, backed
//! by an in-memory storage plane and an RSA keypair used to sign every
//! kite key and access token it issues.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use kite::identity::Identity;
use kite::keys::KeyPair;
use kite::peer::Kite;
use kontrold::registry::{self, RegistryState};
use kontrold::storage::{self, MemBackend};
use kontrold::config;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("kontrold starting");
    info!(listen = %config.listen_addr);

    let signing_keys = KeyPair::generate().expect("failed to generate kontrold signing keypair");

    let kontrol_url = format!("ws://{}/kontrol", config.listen_addr);
    let backend: Arc<dyn storage::Backend> = Arc::new(MemBackend::new());
    storage::spawn_reaper(Arc::clone(&backend), config.heartbeat_interval);

    let state = Arc::new(RegistryState {
        backend,
        signing_keys,
        config: config.clone(),
        kontrol_url: kontrol_url.clone(),
    });

    let identity = Identity {
        username: "kontrol".to_string(),
        environment: "production".to_string(),
        name: "kontrold".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        region: "default".to_string(),
        hostname: kite::Config::hostname(),
        id: Uuid::new_v4(),
    };
    let kite = Kite::new(identity, kite::Config::from_env());
    registry::install_methods(&kite, Arc::clone(&state));

    let app = Router::new()
        .route("/kontrol", get(kontrol_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(kite);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "kontrold listening");

    axum::serve(listener, app).await.expect("server error");
}

/// Axum handler for GET /kontrol, upgrades to WebSocket and hands the
/// connection to the Kite peer's own accept loop.
async fn kontrol_handler(ws: WebSocketUpgrade, State(kite): State<Arc<Kite>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { kite.accept(socket).await })
}

async fn healthz() -> &'static str {
    "ok"
}
