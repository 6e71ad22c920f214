//! Error types for kontrold.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum KontrolError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("query rejected: {0}")]
    InvalidQuery(String),

    #[error("watch expired, resync required")]
    WatchExpired,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Kite(#[from] kite::KiteError),
}

impl IntoResponse for KontrolError {
    fn into_response(self) -> Response {
        let status = match &self {
            KontrolError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KontrolError::NotFound(_) => StatusCode::NOT_FOUND,
            KontrolError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            KontrolError::WatchExpired => StatusCode::GONE,
            KontrolError::Auth(_) => StatusCode::UNAUTHORIZED,
            KontrolError::Kite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
