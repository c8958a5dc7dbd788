//! Edge gateway error types.
//!
//! `EdgeError` is the caller-visible taxonomy: one HTTP status and one stable
//! error token each. Internal detail is logged at the dispatcher boundary and
//! never serialized.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Stable error tokens returned in `{"error": "<token>"}` bodies
pub mod tokens {
    pub const INVALID_KEY: &str = "invalid_key";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
    pub const UPSTREAM_TIMEOUT: &str = "upstream_timeout";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
}

/// Caller-visible pipeline failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EdgeError {
    /// Missing, unknown or revoked API key
    #[error("invalid api key")]
    InvalidKey,

    /// BLOCK decision
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Upstream connect failure or open circuit
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream did not answer in time
    #[error("upstream timeout after {0}ms")]
    UpstreamTimeout(u64),

    /// Project configuration is unusable (e.g. bad upstream URL)
    #[error("misconfigured project: {0}")]
    Misconfigured(String),

    /// Request body over the configured limit
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl EdgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            EdgeError::InvalidKey => StatusCode::UNAUTHORIZED,
            EdgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            EdgeError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            EdgeError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            EdgeError::InvalidKey => tokens::INVALID_KEY,
            EdgeError::RateLimited { .. } => tokens::RATE_LIMITED,
            EdgeError::UpstreamUnavailable(_) => tokens::UPSTREAM_UNAVAILABLE,
            EdgeError::UpstreamTimeout(_) => tokens::UPSTREAM_TIMEOUT,
            EdgeError::Misconfigured(_) => tokens::INTERNAL_ERROR,
            EdgeError::PayloadTooLarge(_) => tokens::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Wire body for every synthesized error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(token: &str) -> Self {
        Self {
            error: token.to_string(),
        }
    }
}

/// Build a JSON error response with a stable token
pub fn error_response(status: StatusCode, token: &str) -> Response {
    (status, Json(ErrorBody::new(token))).into_response()
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let mut response = error_response(self.status(), self.token());
        if let EdgeError::RateLimited { retry_after_secs } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs.max(1)),
            );
        }
        response
    }
}

/// Control-plane lookup failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("control plane unreachable: {0}")]
    Unreachable(String),
    #[error("control plane returned status {0}")]
    Status(u16),
    #[error("malformed control plane response: {0}")]
    Malformed(String),
}

/// Upstream transport failures; a non-2xx status is not one of these
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
    #[error("circuit open for upstream")]
    CircuitOpen,
}

impl From<UpstreamError> for EdgeError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Timeout(ms) => EdgeError::UpstreamTimeout(ms),
            UpstreamError::InvalidUrl(url) => EdgeError::Misconfigured(url),
            other => EdgeError::UpstreamUnavailable(other.to_string()),
        }
    }
}

/// Service-level errors (startup, binding)
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server bind error: {0}")]
    Bind(String),

    #[error("http client error: {0}")]
    Client(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<super::config::ConfigError> for GatewayError {
    fn from(e: super::config::ConfigError) -> Self {
        GatewayError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(EdgeError::InvalidKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            EdgeError::RateLimited { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            EdgeError::UpstreamUnavailable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(EdgeError::UpstreamTimeout(10).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            EdgeError::Misconfigured("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_misconfiguration_is_not_leaked() {
        let err = EdgeError::Misconfigured("upstream_base_url is 'ftp://nope'".into());
        assert_eq!(err.token(), tokens::INTERNAL_ERROR);
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = EdgeError::RateLimited { retry_after_secs: 0 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn test_upstream_error_conversion() {
        assert_eq!(
            EdgeError::from(UpstreamError::Timeout(2000)),
            EdgeError::UpstreamTimeout(2000)
        );
        assert!(matches!(
            EdgeError::from(UpstreamError::CircuitOpen),
            EdgeError::UpstreamUnavailable(_)
        ));
        assert!(matches!(
            EdgeError::from(UpstreamError::InvalidUrl("x".into())),
            EdgeError::Misconfigured(_)
        ));
    }

    #[test]
    fn test_error_body_serialization() {
        let json = serde_json::to_string(&ErrorBody::new(tokens::RATE_LIMITED)).unwrap();
        assert_eq!(json, r#"{"error":"rate_limited"}"#);
    }
}
