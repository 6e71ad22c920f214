//! Error taxonomy shared by every layer of the `kite` crate.
//!
//! The taxonomy is semantic, not 1:1 with Rust variants. Callers match on
//! [`KiteError::kind`] rather than the variant itself so that the same
//! policy (retry, drop connection, surface to caller) applies no matter
//! which layer raised it.

use std::fmt;

/// Coarse-grained error class. Determines what the framework does with the
/// error: `AuthError`/`ProtocolError`/`KeyNotTrusted` close something,
/// `Timeout`/`Retryable` are left to the caller, `InternalError` is reported
/// but the connection survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthError,
    KeyNotTrusted,
    Timeout,
    ConnectionClosed,
    NotFound,
    Retryable,
    ProtocolError,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AuthError => "AuthError",
            Self::KeyNotTrusted => "KeyNotTrusted",
            Self::Timeout => "Timeout",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::NotFound => "NotFound",
            Self::Retryable => "Retryable",
            Self::ProtocolError => "ProtocolError",
            Self::InternalError => "InternalError",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KiteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("signing key not trusted: {0}")]
    KeyNotTrusted(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

impl KiteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::AuthError,
            Self::KeyNotTrusted(_) => ErrorKind::KeyNotTrusted,
            Self::Timeout => ErrorKind::Timeout,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::Internal(_) => ErrorKind::InternalError,
            Self::Serialize(_) => ErrorKind::ProtocolError,
            Self::Transport(_) => ErrorKind::Retryable,
        }
    }

    /// Whether this error should close the whole connection rather than
    /// just fail the one request.
    pub fn closes_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::ProtocolError | ErrorKind::KeyNotTrusted)
    }

    /// The `{type, message, code}` payload sent back to a caller in the
    /// reply callback.
    pub fn as_reply_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind().to_string(),
            "message": self.to_string(),
            "code": self.kind().to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, KiteError>;
