//! Error types for the modelgate proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Proxy error taxonomy. Each variant maps to exactly one client-visible
/// status code.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Unreadable body, invalid JSON, or a non-string `model`.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No slot became free within the admission wait, or the pools are
    /// shutting down.
    #[error("too many requests queued for model '{model}'")]
    QueueFull { model: String },

    /// Dial, TLS, read, or protocol failure from the origin.
    #[error("failed to reach backend: {0}")]
    Upstream(String),

    /// The lifecycle ceiling elapsed before the request reached a terminal
    /// state.
    #[error("request exceeded the {}s lifecycle ceiling", .0.as_secs())]
    Timeout(std::time::Duration),

    /// Caught defect at the handler boundary.
    #[error("internal error: {0}")]
    #[allow(dead_code)]
    Internal(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::QueueFull { .. } => "queue_full",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        }));

        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_their_status_codes() {
        let cases = [
            (ProxyError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                ProxyError::QueueFull { model: "m".into() },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ProxyError::Upstream("refused".into()), StatusCode::BAD_GATEWAY),
            (
                ProxyError::Timeout(std::time::Duration::from_secs(99)),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (ProxyError::Internal("bug".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status(), expected);
        }
    }

    #[test]
    fn timeout_message_names_the_ceiling() {
        let err = ProxyError::Timeout(std::time::Duration::from_secs(99));
        assert_eq!(err.to_string(), "request exceeded the 99s lifecycle ceiling");
    }
}
