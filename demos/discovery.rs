//! Discovery through a running Kontrol: an `adder` peer registers with
//! auth disabled, a `foo` peer watches for it, gets a token, dials it
//! directly, and calls `add`.
//!
//! Run with `cargo run --bin discovery` from this directory. Kontrol here
//! runs in-process (kontrold's own binary spins up the identical pieces
//! behind a real listener); nothing about the client side would change if
//! it were a separate process on the network instead.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use kite::identity::{Identity, Query};
use kite::keys::{KeyPair, KiteKey};
use kite::kontrol_client::{KontrolClient, WatchEvent};
use kite::peer::Kite;
use kontrold::registry::{self, RegistryState};
use kontrold::storage::{self, MemBackend};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

fn identity(username: &str, name: &str) -> Identity {
    Identity {
        username: username.to_string(),
        environment: "dev".to_string(),
        name: name.to_string(),
        version: "0.0.1".to_string(),
        region: "default".to_string(),
        hostname: kite::Config::hostname(),
        id: Uuid::new_v4(),
    }
}

async fn accept_handler(ws: WebSocketUpgrade, State(kite): State<Arc<Kite>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { kite.accept(socket).await })
}

/// Binds a Kite to a loopback port and returns the `ws://` URL peers can
/// dial to reach it.
async fn serve_kite(kite: Arc<Kite>) -> String {
    let app = Router::new().route("/", get(accept_handler)).with_state(kite);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });
    format!("ws://{addr}/")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    // Kontrol, in-process. Bind first so the registry state can carry the
    // real URL it listens on, the same value `registerMachine` would embed
    // in a kite key it issued.
    let signing_keys = KeyPair::generate().expect("keygen");
    let kontrol_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind kontrol");
    let kontrol_addr = kontrol_listener.local_addr().expect("local_addr");
    let kontrol_url = format!("ws://{kontrol_addr}/kontrol");
    println!("kontrol listening at {kontrol_url}");

    let backend: Arc<dyn storage::Backend> = Arc::new(MemBackend::new());
    let kontrol_kite = Kite::new(identity("kontrol", "kontrold"), kite::Config::from_env());
    let state = Arc::new(RegistryState {
        backend,
        signing_keys: signing_keys.clone(),
        config: kontrold::config::Config {
            listen_addr: kontrol_addr.to_string(),
            entry_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            token_ttl: Duration::from_secs(3600),
            log_level: "info".to_string(),
        },
        kontrol_url: kontrol_url.clone(),
    });
    registry::install_methods(&kontrol_kite, Arc::clone(&state));

    let kontrol_app = Router::new()
        .route("/kontrol", get(accept_handler))
        .with_state(kontrol_kite);
    tokio::spawn(async move {
        axum::serve(kontrol_listener, kontrol_app).await.expect("kontrol server error");
    });

    // adder/0.0.1: auth disabled, handler add(a, b) = a + b.
    let adder_identity = identity("devuser", "adder");
    let adder_kite_key = KiteKey::issue(&adder_identity.username, &kontrol_url, &signing_keys).expect("issue kite key");
    let adder_kite = Kite::new(adder_identity.clone(), kite::Config::from_env());
    adder_kite.handle_func_no_auth(
        "add",
        Arc::new(|_ctx, args, _replier| {
            Box::pin(async move {
                let a = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
                let b = args.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(a + b))
            })
        }),
    );
    let adder_url = serve_kite(Arc::clone(&adder_kite)).await;

    let adder_kontrol = KontrolClient::new(kontrol_url.clone(), adder_kite_key);
    adder_kontrol.register_forever(adder_identity.clone(), adder_url).await;

    // foo/0.0.1: watches for adder, fetches a token, dials it directly.
    let foo_identity = identity("devuser", "foo");
    let foo_kite_key = KiteKey::issue(&foo_identity.username, &kontrol_url, &signing_keys).expect("issue kite key");
    let foo_kite = Kite::new(foo_identity, kite::Config::from_env());
    let foo_kontrol = KontrolClient::new(kontrol_url, foo_kite_key);

    let (tx, mut rx) = mpsc::channel(8);
    let _watch = foo_kontrol.watch_kites(Query::by_name("adder"), tx).await.expect("watch_kites");

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watch timed out")
        .expect("watch channel closed");

    let (entry, token) = match event {
        WatchEvent::Register(entry, token) => (entry, token),
        WatchEvent::Deregister(_) => panic!("expected a Register event first"),
        WatchEvent::Expired => panic!("watch expired before adder registered"),
    };
    println!("discovered adder at {} (token: {})", entry.url, token.is_some());

    let conn = foo_kite.dial(&entry.url).await.expect("dial adder");
    let result = conn.call("add", vec![json!(2), json!(3)], Duration::from_secs(5)).await.expect("add(2, 3)");
    println!("add(2, 3) = {result}");
    assert_eq!(result, json!(5));
}
