//! Method handlers, pre/post handler chains, and the per-request context
//! bag.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use super::connection::Connection;
use crate::error::Result;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-request context bag threaded through pre-handlers, the method
/// handler, and post-handlers, so a handler can read the output of the one
/// before it. Also carries the caller's authenticated identity once the
/// request has passed auth, and whether auth was required at all.
#[derive(Clone, Default)]
pub struct RequestContext {
    values: HashMap<String, JsonValue>,
    pub authenticated_username: Option<String>,
    /// The connection this request arrived on. Handlers that need to push
    /// further callback invocations after replying (`watchKites`,
    /// `kite.tunnel`) use this instead of returning a value.
    pub connection: Option<Arc<Connection>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        self.values.insert(key.into(), value);
    }

    pub const RESULT_KEY: &'static str = "__result";
}

/// Handed to a method handler so it can resolve the call explicitly before
/// returning, matching the dnode convention of `function(args..., callback)`
/// handlers: if a handler invokes a supplied callback first, the callback's
/// arguments are the result.
#[derive(Clone)]
pub struct Replier {
    tx: Arc<Mutex<Option<oneshot::Sender<JsonValue>>>>,
}

impl Replier {
    fn new() -> (Self, oneshot::Receiver<JsonValue>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn reply(&self, value: JsonValue) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(value);
        }
    }
}

pub type MethodHandler =
    Arc<dyn Fn(RequestContext, Vec<JsonValue>, Replier) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

pub type PrePostHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<RequestContext>> + Send + Sync>;

/// A registered method: the handler plus whether it requires
/// authentication. Method handlers may individually disable it.
#[derive(Clone)]
pub struct MethodEntry {
    pub handler: MethodHandler,
    pub auth_required: bool,
}

/// Run `ctx` through `args` against `handler`, racing the handler's own
/// return value against an explicit [`Replier::reply`] call; whichever
/// resolves first wins.
pub async fn invoke(handler: &MethodHandler, ctx: RequestContext, args: Vec<JsonValue>) -> Result<JsonValue> {
    let (replier, rx) = Replier::new();
    let fut = (handler)(ctx, args, replier);
    tokio::pin!(fut);
    tokio::pin!(rx);
    tokio::select! {
        biased;
        explicit = &mut rx => {
            if let Ok(value) = explicit {
                return Ok(value);
            }
            fut.await
        }
        returned = &mut fut => returned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_that_returns(value: JsonValue) -> MethodHandler {
        Arc::new(move |_ctx, _args, _replier| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    fn handler_that_replies(value: JsonValue) -> MethodHandler {
        Arc::new(move |_ctx, _args, replier| {
            let value = value.clone();
            Box::pin(async move {
                replier.reply(value);
                Ok(serde_json::json!("ignored"))
            })
        })
    }

    #[tokio::test]
    async fn returns_plain_value_when_no_explicit_reply() {
        let handler = handler_that_returns(serde_json::json!(9));
        let result = invoke(&handler, RequestContext::new(), vec![]).await.unwrap();
        assert_eq!(result, serde_json::json!(9));
    }

    #[tokio::test]
    async fn explicit_reply_wins_over_return_value() {
        let handler = handler_that_replies(serde_json::json!("explicit"));
        let result = invoke(&handler, RequestContext::new(), vec![]).await.unwrap();
        assert_eq!(result, serde_json::json!("explicit"));
    }
}
