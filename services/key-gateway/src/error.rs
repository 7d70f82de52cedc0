//! Client-facing error responses
//!
//! Every error leaves the gateway as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! Pool exhaustion and exhausted retries both surface as 503 "temporarily
//! unavailable" so callers back off instead of seeing upstream internals.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Per-request failures returned to the client.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Pool(#[from] key_pool::Error),

    #[error("response build error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::Pool(key_pool::Error::UnknownPool(_)) => StatusCode::NOT_FOUND,
            GatewayError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidBody(_) => "invalid_request",
            GatewayError::Pool(key_pool::Error::UnknownPool(_)) => "unknown_pool",
            GatewayError::Pool(key_pool::Error::PoolExhausted { .. }) => "pool_exhausted",
            GatewayError::Pool(key_pool::Error::RetriesExhausted { .. }) => "retries_exhausted",
            GatewayError::Internal(_) => "gateway_error",
        }
    }

    /// Message safe to show clients. Upstream error details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Pool(key_pool::Error::PoolExhausted { pool, .. })
            | GatewayError::Pool(key_pool::Error::RetriesExhausted { pool, .. }) => {
                format!("pool {pool} is temporarily unavailable, try again later")
            }
            other => other.to_string(),
        }
    }

    pub fn into_response_with_id(self, request_id: &str) -> Response {
        error_response(
            self.status(),
            self.error_type(),
            &self.client_message(),
            request_id,
        )
    }
}

/// JSON error response with request correlation id.
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
