//! Errors answered to public HTTP callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Host header does not name a tunnel")]
    InvalidHost,

    #[error("No tunnel registered for '{0}'")]
    TunnelNotFound(String),

    #[error("Tunnel '{0}' is not connected")]
    TunnelUnavailable(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("Request body could not be read: {0}")]
    BadRequest(String),

    #[error("Tunnel did not respond in time")]
    Timeout,

    #[error("{0}")]
    Upstream(String),

    #[error("Tunnel sent an invalid response: {0}")]
    InvalidResponse(String),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidHost | BridgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::TunnelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BridgeError::InvalidHost | BridgeError::BadRequest(_) => "Bad Request",
            BridgeError::TunnelNotFound(_) => "Tunnel not found",
            BridgeError::TunnelUnavailable(_) => "Tunnel unavailable",
            BridgeError::Unauthorized(_) => "Unauthorized",
            BridgeError::Timeout => "Gateway Timeout",
            BridgeError::Upstream(_) => "Tunnel error",
            BridgeError::InvalidResponse(_) => "Bad Gateway",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.label(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BridgeError::InvalidHost.status(), StatusCode::BAD_REQUEST);
        assert_eq!(BridgeError::TunnelNotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            BridgeError::TunnelUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(BridgeError::Unauthorized("no").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(BridgeError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            BridgeError::Upstream("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_json_body() {
        let response = BridgeError::TunnelNotFound("abc12345".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"], "Tunnel not found");
        assert_eq!(value["message"], "No tunnel registered for 'abc12345'");
    }
}
