//! Core domain types shared by the pipeline stages.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

/// Header carrying the caller's API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Opaque project identifier issued by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of an API key secret. Secrets themselves are never stored.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn of(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// First 8 hex chars, safe for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({}..)", self.short())
    }
}

/// Read-only projection of a control-plane project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub upstream_base_url: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Persisted API key record; only the hash of the secret is kept
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: uuid::Uuid,
    pub project_id: ProjectId,
    pub secret_hash: KeyHash,
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// What a valid key resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub project_id: ProjectId,
    pub upstream_base_url: String,
}

/// Rolling windows are keyed by project and normalized endpoint path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub project_id: ProjectId,
    pub endpoint: String,
}

impl EndpointKey {
    pub fn new(project_id: ProjectId, endpoint: impl Into<String>) -> Self {
        Self {
            project_id,
            endpoint: endpoint.into(),
        }
    }
}

/// Rate-limit state of the caller at decision time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStatus {
    /// Within the soft quota
    Within,
    /// Soft quota exhausted, hard ceiling not reached
    Moderate { retry_after_ms: u64 },
    /// Hard ceiling exhausted
    Exceeded { retry_after_ms: u64 },
}

/// Request-level anomaly signals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyFlags {
    pub missing_user_agent: bool,
    pub path_traversal: bool,
    pub oversized_body: bool,
}

impl AnomalyFlags {
    pub fn count(&self) -> u32 {
        self.missing_user_agent as u32 + self.path_traversal as u32 + self.oversized_body as u32
    }
}

/// Request-level inputs to the risk scorer
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    /// 0.0 (clean) to 1.0 (repeatedly mitigated)
    pub client_reputation: f64,
    pub flags: AnomalyFlags,
}

/// How a request ended, folded into the endpoint window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Forwarded with no delay; carries the upstream status
    Allowed { status: u16 },
    /// Forwarded with injected delay; carries the upstream status
    Throttled { status: u16 },
    /// Rejected with 429, upstream never contacted
    Blocked,
    /// Upstream transport failure or timeout (502/504)
    UpstreamFailed { throttled: bool },
    /// Project configuration unusable (500)
    Misconfigured,
    /// Request body over the limit (413), upstream never contacted
    PayloadRejected,
    /// Caller went away before a response was produced
    Aborted { throttled: bool },
}

impl Outcome {
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            Outcome::Throttled { .. }
                | Outcome::UpstreamFailed { throttled: true }
                | Outcome::Aborted { throttled: true }
        )
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Outcome::Blocked)
    }

    /// 5xx from upstream, or a failure the gateway had to answer for
    pub fn is_error(&self) -> bool {
        match self {
            Outcome::Allowed { status } | Outcome::Throttled { status } => *status >= 500,
            Outcome::UpstreamFailed { .. } | Outcome::Misconfigured => true,
            Outcome::Blocked | Outcome::PayloadRejected | Outcome::Aborted { .. } => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Allowed { .. } => "allowed",
            Outcome::Throttled { .. } => "throttled",
            Outcome::Blocked => "blocked",
            Outcome::UpstreamFailed { .. } => "upstream_failed",
            Outcome::Misconfigured => "misconfigured",
            Outcome::PayloadRejected => "payload_rejected",
            Outcome::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_is_stable_and_short_is_prefix() {
        let a = KeyHash::of("sk_live_12345abcdef");
        let b = KeyHash::of("sk_live_12345abcdef");
        assert_eq!(a, b);
        assert_ne!(a, KeyHash::of("sk_live_other"));
        assert_eq!(a.short().len(), 8);
        assert!(!format!("{:?}", a).contains("sk_live"));
    }

    #[test]
    fn test_outcome_classification() {
        assert!(Outcome::Throttled { status: 200 }.is_throttled());
        assert!(!Outcome::Throttled { status: 200 }.is_error());
        assert!(Outcome::Allowed { status: 503 }.is_error());
        assert!(!Outcome::Allowed { status: 404 }.is_error());
        assert!(Outcome::Blocked.is_blocked());
        assert!(Outcome::UpstreamFailed { throttled: true }.is_throttled());
        assert!(Outcome::Aborted { throttled: false }.is_aborted());
    }

    #[test]
    fn test_anomaly_flag_count() {
        let flags = AnomalyFlags {
            missing_user_agent: true,
            path_traversal: true,
            oversized_body: false,
        };
        assert_eq!(flags.count(), 2);
        assert_eq!(AnomalyFlags::default().count(), 0);
    }
}
