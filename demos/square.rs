//! A directly-dialed RPC call with no Kontrol involved: a kite named
//! `math/1.0.0` exposes `square`, a caller dials it and calls `square`.
//!
//! Run with `cargo run --bin square` from this directory.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use kite::identity::Identity;
use kite::peer::Kite;
use serde_json::json;
use uuid::Uuid;

fn identity(name: &str) -> Identity {
    Identity {
        username: "demo".to_string(),
        environment: "dev".to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        region: "default".to_string(),
        hostname: kite::Config::hostname(),
        id: Uuid::new_v4(),
    }
}

async fn accept_handler(ws: WebSocketUpgrade, State(kite): State<Arc<Kite>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { kite.accept(socket).await })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let math = Kite::new(identity("math"), kite::Config::from_env());

    // Open to anyone: a type mismatch here panics, same as an untyped
    // language's runtime would, and the framework turns that into an
    // InternalError reply without dropping the connection.
    math.handle_func_no_auth(
        "square",
        Arc::new(|_ctx, args, _replier| {
            Box::pin(async move {
                let n = args.first().expect("square: missing argument").as_i64().expect("square: expected a number");
                Ok(json!(n * n))
            })
        }),
    );

    // Requires authentication; this demo never configures a verifier or a
    // kite key, so every call to it fails auth before the handler runs.
    math.handle_func(
        "secureSquare",
        Arc::new(|_ctx, args, _replier| {
            Box::pin(async move {
                let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(n * n))
            })
        }),
    );

    let app = Router::new().route("/", get(accept_handler)).with_state(math);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });

    let caller = Kite::new(identity("caller"), kite::Config::from_env());
    let conn = caller.dial(&format!("ws://{addr}/")).await.expect("dial");

    let result = conn.call("square", vec![json!(3)], Duration::from_secs(5)).await.expect("square(3)");
    println!("square(3) = {result}");
    assert_eq!(result, json!(9));

    match conn.call("square", vec![json!("x")], Duration::from_secs(5)).await {
        Err(e) => println!("square(\"x\") = {e} (InternalError, handler panicked, connection survives)"),
        Ok(v) => println!("unexpected success: {v}"),
    }

    match conn.call("secureSquare", vec![json!(3)], Duration::from_secs(5)).await {
        Err(e) => println!("secureSquare(3) = {e} (AuthError, no credentials presented)"),
        Ok(v) => println!("unexpected success: {v}"),
    }

    // The connection is still usable after the InternalError above.
    let result = conn.call("square", vec![json!(4)], Duration::from_secs(5)).await.expect("square(4)");
    println!("square(4) = {result}");
    assert_eq!(result, json!(16));
}
