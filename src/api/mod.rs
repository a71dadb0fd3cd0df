//! HTTP boundary. Extends a bare `/api/health`/`/api/info` pair with the
//! query-layer routes. The sync core (pool, queries, media decoder)
//! stays plain native-thread code; every handler enters it via
//! `tokio::task::spawn_blocking` so the blocking `rusqlite::Connection`
//! underneath never runs on the async executor's own threads.

pub mod http;

use crate::error::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Maps `CoreError` to an HTTP status, splitting bad-input kinds (4xx)
/// from internal kinds (5xx).
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::KeyNotFound
            | CoreError::IncorrectKey
            | CoreError::UnknownMediaFormat
            | CoreError::IncompleteRead
            | CoreError::InvalidPath(_)
            | CoreError::AlreadyDecrypted => StatusCode::BAD_REQUEST,
            CoreError::WriteFailed(_)
            | CoreError::HashVerificationFailed(_)
            | CoreError::PermissionDenied
            | CoreError::PlatformUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
