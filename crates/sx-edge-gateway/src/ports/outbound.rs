//! Outbound ports for the edge gateway.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::domain::error::{IdentityError, UpstreamError};
use crate::domain::types::ProjectId;

/// Time source trait for testability
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

/// System time implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            // Clock before Unix epoch - return 0 rather than panic
            .unwrap_or(0)
    }
}

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_millis(secs * 1000);
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Control-plane answer for a presented secret
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyValidation {
    #[serde(alias = "projectId")]
    pub project_id: ProjectId,
    #[serde(alias = "upstreamBaseUrl")]
    pub upstream_base_url: String,
    pub active: bool,
}

/// Source of truth for API key validity
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// `Ok(None)` means the secret is unknown.
    async fn validate(&self, secret: &str) -> Result<Option<KeyValidation>, IdentityError>;
}

/// Request to replay against a project upstream
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Upstream answer relayed to the caller
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Transport to project upstreams
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<UpstreamResponse, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance_secs(2);
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_key_validation_accepts_camel_case() {
        let v: KeyValidation = serde_json::from_str(
            r#"{"projectId":"p1","upstreamBaseUrl":"https://api.example.com","active":true}"#,
        )
        .unwrap();
        assert_eq!(v.project_id, ProjectId::new("p1"));
        assert!(v.active);
    }
}
