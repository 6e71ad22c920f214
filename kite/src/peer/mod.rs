//! The Kite RPC peer: a symmetric endpoint that both serves methods and
//! calls methods on peers, multiplexing concurrent requests and callback
//! references over one duplex connection per peer.

pub mod connection;
pub mod handler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dnode::{self, AuthInfo};
use crate::error::{KiteError, Result};
use crate::identity::Identity;
use crate::keys::{token::Verifier, KiteKey};
use crate::transport::websocket::{WsClientTransport, WsServerTransport};
use crate::transport::{HeartbeatConfig, Transport};

pub use connection::{Connection, ConnectionState};
pub use handler::{MethodEntry, MethodHandler, PrePostHandler, Replier, RequestContext};

type LifecycleHook = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// A Kite: the identity it advertises, the methods it serves, and every
/// live connection to a peer. A Kite exclusively owns its connections and
/// their callback tables.
pub struct Kite {
    pub identity: Identity,
    pub config: Config,
    methods: DashMap<String, MethodEntry>,
    pre_handlers: Mutex<Vec<PrePostHandler>>,
    post_handlers: Mutex<Vec<PrePostHandler>>,
    connections: DashMap<Uuid, Arc<Connection>>,
    disable_concurrency: AtomicBool,
    on_first_request: Mutex<Vec<LifecycleHook>>,
    on_connect: Mutex<Vec<LifecycleHook>>,
    on_disconnect: Mutex<Vec<LifecycleHook>>,
    verifier: Mutex<Option<Arc<dyn Verifier>>>,
    kite_key: Mutex<Option<KiteKey>>,
}

impl Kite {
    pub fn new(identity: Identity, config: Config) -> Arc<Self> {
        let kite = Arc::new(Self {
            identity,
            config,
            methods: DashMap::new(),
            pre_handlers: Mutex::new(Vec::new()),
            post_handlers: Mutex::new(Vec::new()),
            connections: DashMap::new(),
            disable_concurrency: AtomicBool::new(false),
            on_first_request: Mutex::new(Vec::new()),
            on_connect: Mutex::new(Vec::new()),
            on_disconnect: Mutex::new(Vec::new()),
            verifier: Mutex::new(None),
            kite_key: Mutex::new(None),
        });
        register_builtins(&kite);
        kite
    }

    pub async fn set_kite_key(&self, key: KiteKey) {
        *self.kite_key.lock().await = Some(key);
    }

    pub async fn set_verifier(&self, verifier: Arc<dyn Verifier>) {
        *self.verifier.lock().await = Some(verifier);
    }

    pub fn disable_concurrency(&self) {
        self.disable_concurrency.store(true, Ordering::Relaxed);
    }

    /// Register a method handler (`HandleFunc`).
    pub fn handle_func(&self, method: impl Into<String>, handler: MethodHandler) {
        self.methods.insert(
            method.into(),
            MethodEntry {
                handler,
                auth_required: true,
            },
        );
    }

    /// Register a method handler with authentication disabled for it
    /// specifically.
    pub fn handle_func_no_auth(&self, method: impl Into<String>, handler: MethodHandler) {
        self.methods.insert(
            method.into(),
            MethodEntry {
                handler,
                auth_required: false,
            },
        );
    }

    pub async fn add_pre_handler(&self, handler: PrePostHandler) {
        self.pre_handlers.lock().await.push(handler);
    }

    pub async fn add_post_handler(&self, handler: PrePostHandler) {
        self.post_handlers.lock().await.push(handler);
    }

    pub async fn on_first_request(&self, f: LifecycleHook) {
        self.on_first_request.lock().await.push(f);
    }

    pub async fn on_connect(&self, f: LifecycleHook) {
        self.on_connect.lock().await.push(f);
    }

    pub async fn on_disconnect(&self, f: LifecycleHook) {
        self.on_disconnect.lock().await.push(f);
    }

    /// Dial a peer and start its reader loop. Starts in `Dialing`, flips to
    /// `Connected` once the handshake completes.
    pub async fn dial(self: &Arc<Self>, url: &str) -> Result<Arc<Connection>> {
        let transport = WsClientTransport::dial(url).await?;
        transport.spawn_heartbeat(HeartbeatConfig::default());
        let conn = Arc::new(Connection::new(Arc::new(transport)));
        conn.set_state(ConnectionState::Connected);
        self.adopt(Arc::clone(&conn)).await;
        Ok(conn)
    }

    /// Accept an inbound `axum` WebSocket upgrade: the server half of the
    /// same symmetric connection type `dial` produces.
    pub async fn accept(self: &Arc<Self>, socket: WebSocket) {
        let transport = WsServerTransport::new(socket);
        transport.spawn_heartbeat(HeartbeatConfig::default());
        let conn = Arc::new(Connection::new(Arc::new(transport)));
        conn.set_state(ConnectionState::Connected);
        self.adopt(Arc::clone(&conn)).await;
    }

    async fn adopt(self: &Arc<Self>, conn: Arc<Connection>) {
        self.connections.insert(conn.id, Arc::clone(&conn));
        for hook in self.on_connect.lock().await.iter() {
            hook(Arc::clone(&conn));
        }
        let kite = Arc::clone(self);
        tokio::spawn(async move {
            kite.reader_loop(conn).await;
        });
    }

    /// Drives one connection's inbound frames until it closes. The reader
    /// task is the only mutator of the callback table.
    async fn reader_loop(self: Arc<Self>, conn: Arc<Connection>) {
        let mut first_request = true;
        loop {
            let msg = match conn.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = %conn.id, "recv error: {e}");
                    break;
                }
            };

            match connection::classify(&msg) {
                connection::MessageKind::Callback(id) => {
                    if let Err(e) = conn.callbacks().dispatch(id, msg.arguments.clone()) {
                        warn!(conn = %conn.id, "{e}, closing connection (protocol error)");
                        break;
                    }
                }
                connection::MessageKind::MethodCall(_) => {
                    if first_request {
                        first_request = false;
                        for hook in self.on_first_request.lock().await.iter() {
                            hook(Arc::clone(&conn));
                        }
                    }
                    let kite = Arc::clone(&self);
                    let conn2 = Arc::clone(&conn);
                    let task = tokio::spawn(async move { kite.dispatch(conn2, msg).await });
                    if self.disable_concurrency.load(Ordering::Relaxed) {
                        let _ = task.await;
                    }
                }
            }
        }

        conn.close().await;
        self.connections.remove(&conn.id);
        for hook in self.on_disconnect.lock().await.iter() {
            hook(Arc::clone(&conn));
        }
    }

    /// Dispatch one inbound method call: auth, pre-handlers, the handler
    /// itself, post-handlers, and the reply. A panicking handler becomes an
    /// `InternalError` reply; the connection is not dropped.
    async fn dispatch(self: Arc<Self>, conn: Arc<Connection>, msg: dnode::Message) {
        let reply_id = msg.callbacks.first().copied();
        let method_name = msg.method.clone();

        let outcome = self.dispatch_inner(&conn, &msg).await;

        if let Some(reply_id) = reply_id {
            let (result, error) = match outcome {
                Ok(value) => (value, None),
                Err(e) => (JsonValue::Null, Some(e.as_reply_payload())),
            };
            if let Err(e) = conn.reply(reply_id, result, error).await {
                debug!(method = %method_name, "failed to send reply: {e}");
            }
        } else if let Err(e) = outcome {
            debug!(method = %method_name, "Go call failed: {e}");
        }
    }

    async fn dispatch_inner(&self, conn: &Arc<Connection>, msg: &dnode::Message) -> Result<JsonValue> {
        let entry = self
            .methods
            .get(&msg.method)
            .map(|e| e.clone())
            .ok_or_else(|| KiteError::NotFound(format!("no such method: {}", msg.method)))?;

        let mut ctx = RequestContext::new();
        ctx.connection = Some(Arc::clone(conn));

        if entry.auth_required {
            ctx.authenticated_username = Some(self.authenticate(msg).await?);
        }

        for pre in self.pre_handlers.lock().await.iter() {
            ctx = pre(ctx.clone()).await?;
        }

        let result = std::panic::AssertUnwindSafe(handler::invoke(&entry.handler, ctx.clone(), msg.arguments.clone()))
            .catch_unwind()
            .await;

        let result = match result {
            Ok(inner) => inner,
            Err(_panic) => Err(KiteError::Internal(format!(
                "handler for {} panicked",
                msg.method
            ))),
        };

        ctx.set(
            RequestContext::RESULT_KEY,
            match &result {
                Ok(v) => v.clone(),
                Err(e) => e.as_reply_payload(),
            },
        );

        for post in self.post_handlers.lock().await.iter() {
            ctx = post(ctx.clone()).await?;
        }

        result.map(|_| ctx.get(RequestContext::RESULT_KEY).cloned().unwrap_or(JsonValue::Null))
    }

    /// Runs the verification protocol against a presented token or kite
    /// key. The kite-key trust check itself happens when a connection first
    /// presents a kite key, handled by [`Self::set_verifier`]'s caller.
    async fn authenticate(&self, msg: &dnode::Message) -> Result<String> {
        let auth = msg
            .auth()
            .ok_or_else(|| KiteError::Auth("no authentication presented".into()))?;

        match auth.kind.as_str() {
            "token" => {
                let verifier = self.verifier.lock().await.clone().ok_or_else(|| {
                    KiteError::Internal("no token verifier configured".into())
                })?;
                let claims = verifier.verify(&auth.key, &self.identity.path()).await?;
                Ok(claims.sub)
            }
            "kiteKey" => {
                let key = KiteKey::parse(&auth.key)?;
                Ok(key.claims.sub)
            }
            other => Err(KiteError::Auth(format!("unsupported auth type: {other}"))),
        }
    }

    /// Synchronous call with timeout (`Tell`, default 15s).
    pub async fn tell(
        &self,
        conn: &Connection,
        method: &str,
        args: Vec<JsonValue>,
        auth: Option<AuthInfo>,
    ) -> Result<JsonValue> {
        let timeout = self.config.timeout;
        self.tell_with_timeout(conn, method, args, auth, timeout).await
    }

    pub async fn tell_with_timeout(
        &self,
        conn: &Connection,
        method: &str,
        args: Vec<JsonValue>,
        _auth: Option<AuthInfo>,
        timeout: Duration,
    ) -> Result<JsonValue> {
        conn.call(method, args, timeout).await
    }

    /// Fire-and-forget call (`Go`).
    pub async fn go(&self, conn: &Connection, method: &str, args: Vec<JsonValue>) -> Result<()> {
        conn.notify(method, args).await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Installs the `kite.tunnel` builtin: when a tunnel proxy calls it, this
    /// kite dials the given URL and adopts whatever comes back as an
    /// ordinary peer connection, exactly like any other `dial`. The proxy
    /// bridges that connection's bytes to the external caller transparently,
    /// so from this kite's point of view a tunneled call looks identical to
    /// a direct one. Only kites that registered through a `TunnelRegistrar`
    /// need this.
    pub fn enable_tunnel_support(self: &Arc<Self>) {
        let kite = Arc::clone(self);
        self.handle_func_no_auth(
            "kite.tunnel",
            Arc::new(move |_ctx, args, _replier| {
                let kite = Arc::clone(&kite);
                Box::pin(async move {
                    let url = args
                        .first()
                        .and_then(|v| v.get("url"))
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| KiteError::Protocol("kite.tunnel: missing url".into()))?
                        .to_string();
                    let kite = Arc::clone(&kite);
                    tokio::spawn(async move {
                        if let Err(e) = kite.dial(&url).await {
                            warn!("tunnel dial to {url} failed: {e}");
                        }
                    });
                    Ok(JsonValue::Bool(true))
                })
            }),
        );
    }
}

use futures::FutureExt;

/// Installs the built-in methods every kite serves: `kite.ping`,
/// `kite.heartbeat`, `kite.log`. `kite.tunnel` is installed separately by
/// callers that opt into tunnel support, since it needs a handle back to
/// the local transport dialer.
fn register_builtins(kite: &Arc<Kite>) {
    kite.handle_func_no_auth(
        "kite.ping",
        Arc::new(|_ctx, _args, _replier| Box::pin(async move { Ok(JsonValue::String("pong".into())) })),
    );

    kite.handle_func_no_auth(
        "kite.heartbeat",
        Arc::new(|_ctx, _args, _replier| Box::pin(async move { Ok(JsonValue::Bool(true)) })),
    );

    kite.handle_func_no_auth(
        "kite.log",
        Arc::new(|ctx, args, _replier| {
            Box::pin(async move {
                info!(caller = ?ctx.authenticated_username, message = ?args.first(), "kite.log");
                Ok(JsonValue::Null)
            })
        }),
    );
}
