//! One duplex connection: ordered outbound queue (via the transport),
//! pending-request/callback side-table, and the `Dialing -> Connected ->
//! Authenticated -> Closed` state machine.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::dnode::{self, AuthInfo, Callback, CallbackTable, Message};
use crate::error::{KiteError, Result};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Dialing = 0,
    Connected = 1,
    Authenticated = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Dialing,
            1 => Self::Connected,
            2 => Self::Authenticated,
            _ => Self::Closed,
        }
    }
}

/// A live connection to one peer. Owns the transport and the callback
/// table; dispatch of inbound *method* calls (as opposed to callback
/// invocations, which this type handles itself) is delegated back to
/// whoever drives [`Connection::run`], normally the owning `Kite`.
pub struct Connection {
    pub id: uuid::Uuid,
    transport: Arc<dyn Transport>,
    callbacks: Arc<CallbackTable>,
    state: AtomicU8,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            transport,
            callbacks: Arc::new(CallbackTable::new()),
            state: AtomicU8::new(ConnectionState::Dialing as u8),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions are monotonic; moving "backwards" is a no-op.
    pub fn set_state(&self, new: ConnectionState) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= new as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(current, new as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn callbacks(&self) -> &Arc<CallbackTable> {
        &self.callbacks
    }

    async fn send_message(&self, msg: &Message) -> Result<()> {
        let frame = dnode::encode(msg)?;
        self.transport.send(frame).await
    }

    /// Issue a call and await the reply (`Tell`), subject to `timeout`.
    pub async fn call(
        &self,
        method: &str,
        arguments: Vec<JsonValue>,
        timeout: std::time::Duration,
    ) -> Result<JsonValue> {
        self.call_with_auth(method, arguments, timeout, None).await
    }

    /// Same as [`Self::call`], additionally attaching `auth` to the request
    /// (the authentication a callee's method handlers will check).
    pub async fn call_with_auth(
        &self,
        method: &str,
        arguments: Vec<JsonValue>,
        timeout: std::time::Duration,
        auth: Option<AuthInfo>,
    ) -> Result<JsonValue> {
        if self.is_closed() {
            return Err(KiteError::ConnectionClosed);
        }
        let (msg, rx) = dnode::build_call(&self.callbacks, method, arguments);
        let msg = match auth {
            Some(a) => msg.with_auth(a),
            None => msg,
        };
        self.send_message(&msg).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((result, None))) => Ok(result),
            Ok(Ok((_, Some(error)))) => Err(KiteError::Internal(error.to_string())),
            Ok(Err(_recv_cancelled)) => Err(KiteError::ConnectionClosed),
            Err(_elapsed) => {
                // Remove the stale waiter so a late reply doesn't leave its
                // slot in the table forever.
                self.callbacks.remove(msg.callbacks[0]);
                Err(KiteError::Timeout)
            }
        }
    }

    /// Fire-and-forget call (`Go`); no reply callback allocated.
    pub async fn notify(&self, method: &str, arguments: Vec<JsonValue>) -> Result<()> {
        self.notify_with_auth(method, arguments, None).await
    }

    pub async fn notify_with_auth(
        &self,
        method: &str,
        arguments: Vec<JsonValue>,
        auth: Option<AuthInfo>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(KiteError::ConnectionClosed);
        }
        let msg = dnode::build_go(method, arguments);
        let msg = match auth {
            Some(a) => msg.with_auth(a),
            None => msg,
        };
        self.send_message(&msg).await
    }

    /// Send a reply for an inbound request's reply-callback id.
    pub async fn reply(&self, reply_callback_id: u64, result: JsonValue, error: Option<JsonValue>) -> Result<()> {
        let args = match error {
            Some(e) => vec![result, e],
            None => vec![result],
        };
        let msg = Message {
            method: reply_callback_id.to_string(),
            arguments: args,
            links: JsonValue::Null,
            callbacks: vec![],
        };
        self.send_message(&msg).await
    }

    /// Invoke a callback the peer installed under `callback_id`, passing
    /// `args` verbatim. Unlike [`Self::reply`], this never splits `args`
    /// into a `(result, error)` pair, since handler-style callbacks (as
    /// opposed to a `Tell`'s reply callback) receive their arguments as-is.
    pub async fn invoke_callback(&self, callback_id: u64, args: Vec<JsonValue>) -> Result<()> {
        let msg = Message {
            method: callback_id.to_string(),
            arguments: args,
            links: JsonValue::Null,
            callbacks: vec![],
        };
        self.send_message(&msg).await
    }

    /// Install a handler callback under a fresh id and return the
    /// placeholder to embed in an outbound argument list.
    pub fn install_callback(&self, f: Arc<dyn Fn(Vec<JsonValue>) + Send + Sync>) -> dnode::CallbackPlaceholder {
        let id = self.callbacks.alloc_id();
        self.callbacks.install(id, Callback::Handler(f));
        dnode::CallbackPlaceholder::new(id)
    }

    /// Receive the next frame from the transport, decoding it. `Ok(None)`
    /// means the peer closed the connection. Meant to be driven by a single
    /// reader loop per connection: only the connection's reader mutates
    /// the callback table.
    pub async fn recv(&self) -> Result<Option<Message>> {
        match self.transport.recv().await? {
            Some(text) => Ok(Some(dnode::decode(&text)?)),
            None => Ok(None),
        }
    }

    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.transport.close().await;
    }
}

/// Classifies an inbound message as either a callback invocation (its
/// `method` is a bare integer matching an installed id) or a genuine
/// method call.
pub fn classify(msg: &Message) -> MessageKind<'_> {
    match msg.method.parse::<u64>() {
        Ok(id) => MessageKind::Callback(id),
        Err(_) => MessageKind::MethodCall(&msg.method),
    }
}

pub enum MessageKind<'a> {
    Callback(u64),
    MethodCall(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn send(&self, _frame: String) -> Result<()> {
            Ok(())
        }
        async fn recv(&self) -> Result<Option<String>> {
            Ok(None)
        }
        async fn close(&self) {}
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let conn = Connection::new(Arc::new(NoopTransport));
        conn.set_state(ConnectionState::Connected);
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.set_state(ConnectionState::Dialing);
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.set_state(ConnectionState::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn classify_distinguishes_callback_from_method() {
        let method_call = Message {
            method: "square".into(),
            arguments: vec![],
            links: JsonValue::Null,
            callbacks: vec![],
        };
        let callback_invocation = Message {
            method: "7".into(),
            arguments: vec![],
            links: JsonValue::Null,
            callbacks: vec![],
        };
        assert!(matches!(classify(&method_call), MessageKind::MethodCall("square")));
        assert!(matches!(classify(&callback_invocation), MessageKind::Callback(7)));
    }
}
