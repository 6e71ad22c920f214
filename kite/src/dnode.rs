//! Dnode codec. Frames bidirectional messages with first-class callback
//! references.
//!
//! A function-valued argument is never serialized as code: it is replaced
//! with a placeholder `{ "function": true, "callbackId": N }`. The receiver
//! installs a stub under `N` in its [`CallbackTable`]; invoking the stub
//! sends a fresh `Message` whose `method` is that id. Every `Tell`-style call
//! appends its own reply callback the same way, so "get the result back" and
//! "call a function I was handed" are the same mechanism.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::error::{KiteError, Result};

/// Wire form of a dnode frame. `callbacks` maps callback id -> placeholder
/// path within `arguments` is left implicit: callers pass already-substituted
/// `arguments` containing `{function:true,callbackId}` placeholders, and
/// `callbacks` simply lists which ids were allocated for this message so the
/// receiver knows to install stubs even if it never walks into that part of
/// the JSON tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<JsonValue>,
    /// Links are opaque associated data; no semantics are placed on them
    /// beyond "opaque JSON". A request's authentication rides here as
    /// `{"auth": {"type": ..., "key": ...}}`, not as a positional argument,
    /// since the codec never schema-checks arguments and auth has to
    /// survive regardless of a handler's own argument shape.
    #[serde(default)]
    pub links: JsonValue,
    #[serde(default)]
    pub callbacks: Vec<u64>,
}

/// A request's authentication: a kind plus a key. `kind` is `"token"`
/// for an access token or `"kiteKey"` for a kite key presented directly
/// (used when a kite calls Kontrol itself, which has no token to present
/// yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
}

impl Message {
    pub fn auth(&self) -> Option<AuthInfo> {
        self.links.get("auth").and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn with_auth(mut self, auth: AuthInfo) -> Self {
        self.links = serde_json::json!({ "auth": auth });
        self
    }
}

/// A placeholder standing in for a function-valued argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPlaceholder {
    pub function: bool,
    pub callback_id: u64,
}

impl CallbackPlaceholder {
    pub fn new(callback_id: u64) -> Self {
        Self {
            function: true,
            callback_id,
        }
    }
}

/// A callback waiting to be invoked by the peer: either the one-shot waiter
/// behind a `Tell` reply, or a long-lived handler a caller installed and
/// passed as an argument.
pub enum Callback {
    /// Resolves the pending `Tell`/`Go` reply waiter with `(result, error)`.
    Reply(oneshot::Sender<(JsonValue, Option<JsonValue>)>),
    /// A handler the local side registered and handed to the peer; invoked
    /// every time the peer sends a message whose method equals the id.
    Handler(Arc<dyn Fn(Vec<JsonValue>) + Send + Sync>),
}

/// Per-connection callback id allocator and side-table. Ids are stable and
/// monotonic for the lifetime of the connection and are never reused. Once
/// a callback is consumed (a `Reply`) or the connection closes, its slot is
/// simply removed, not recycled.
#[derive(Default)]
pub struct CallbackTable {
    next_id: AtomicU64,
    table: DashMap<u64, Callback>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: DashMap::new(),
        }
    }

    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn install(&self, id: u64, cb: Callback) {
        self.table.insert(id, cb);
    }

    /// Invoke the callback registered under `id` with `args`. A message
    /// whose method names an id not currently installed is a protocol
    /// error; the caller should close the connection.
    pub fn dispatch(&self, id: u64, args: Vec<JsonValue>) -> Result<()> {
        match self.table.remove(&id) {
            Some((_, Callback::Reply(tx))) => {
                let (result, error) = split_reply_args(args);
                let _ = tx.send((result, error));
                Ok(())
            }
            Some((_, Callback::Handler(f))) => {
                // Handlers may be invoked repeatedly, so reinstall them.
                self.table.insert(id, Callback::Handler(Arc::clone(&f)));
                f(args);
                Ok(())
            }
            None => Err(KiteError::Protocol(format!(
                "unknown callback id {id}"
            ))),
        }
    }

    pub fn remove(&self, id: u64) {
        self.table.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Reply callbacks are invoked with `(result)` on success or `(null, error)`
/// on failure. This mirrors the `(err, result)`-by-convention shape of
/// dnode-style reply callbacks, adapted to `(result, error)` since `kite`
/// always has exactly one of the two.
fn split_reply_args(mut args: Vec<JsonValue>) -> (JsonValue, Option<JsonValue>) {
    match args.len() {
        0 => (JsonValue::Null, None),
        1 => (args.remove(0), None),
        _ => {
            let error = args.remove(1);
            let result = args.remove(0);
            if error.is_null() {
                (result, None)
            } else {
                (result, Some(error))
            }
        }
    }
}

/// Build an outbound call message, allocating and installing a fresh reply
/// callback. Returns the message to send and the receiver to await.
pub fn build_call(
    table: &CallbackTable,
    method: &str,
    arguments: Vec<JsonValue>,
) -> (Message, oneshot::Receiver<(JsonValue, Option<JsonValue>)>) {
    let reply_id = table.alloc_id();
    let (tx, rx) = oneshot::channel();
    table.install(reply_id, Callback::Reply(tx));
    let msg = Message {
        method: method.to_string(),
        arguments,
        links: JsonValue::Null,
        callbacks: vec![reply_id],
    };
    (msg, rx)
}

/// Build a fire-and-forget message (`Go`); no reply callback is allocated.
pub fn build_go(method: &str, arguments: Vec<JsonValue>) -> Message {
    Message {
        method: method.to_string(),
        arguments,
        links: JsonValue::Null,
        callbacks: vec![],
    }
}

pub fn encode(msg: &Message) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode(text: &str) -> Result<Message> {
    serde_json::from_str(text)
        .map_err(|e| KiteError::Protocol(format!("malformed dnode frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let msg = Message {
            method: "add".into(),
            arguments: vec![serde_json::json!(2), serde_json::json!(3)],
            links: JsonValue::Null,
            callbacks: vec![1],
        };
        let encoded = encode(&msg).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.method, "add");
        assert_eq!(decoded.callbacks, vec![1]);
    }

    #[test]
    fn unknown_callback_id_is_protocol_error() {
        let table = CallbackTable::new();
        let err = table.dispatch(42, vec![]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolError);
    }

    #[test]
    fn reply_callback_resolves_waiter() {
        let table = CallbackTable::new();
        let (msg, rx) = build_call(&table, "square", vec![serde_json::json!(3)]);
        let reply_id = msg.callbacks[0];
        table
            .dispatch(reply_id, vec![serde_json::json!(9)])
            .unwrap();
        let (result, error) = rx.try_recv().unwrap();
        assert_eq!(result, serde_json::json!(9));
        assert!(error.is_none());
    }

    #[test]
    fn handler_callback_survives_repeated_invocation() {
        let table = CallbackTable::new();
        let id = table.alloc_id();
        let calls = Arc::new(std::sync::Mutex::new(0));
        let calls2 = Arc::clone(&calls);
        table.install(
            id,
            Callback::Handler(Arc::new(move |_args| {
                *calls2.lock().unwrap() += 1;
            })),
        );
        table.dispatch(id, vec![]).unwrap();
        table.dispatch(id, vec![]).unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
