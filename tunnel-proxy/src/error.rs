//! Error types for tunnel-proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no such private kite: {0}")]
    UnknownKite(String),

    #[error("tunnel token invalid: {0}")]
    BadToken(String),

    #[error("no such pending tunnel")]
    UnknownTunnel,

    #[error("private kite did not accept the tunnel in time")]
    TunnelTimedOut,

    #[error(transparent)]
    Kite(#[from] kite::KiteError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::UnknownKite(_) => StatusCode::NOT_FOUND,
            ProxyError::BadToken(_) => StatusCode::UNAUTHORIZED,
            ProxyError::UnknownTunnel => StatusCode::GONE,
            ProxyError::TunnelTimedOut => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Kite(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
