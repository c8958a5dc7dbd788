//! Gateway-wide counters.
//!
//! Exposed as JSON on the analysis listener and, with the `metrics` feature,
//! in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::types::Outcome;

/// Edge gateway metrics
#[derive(Default)]
pub struct GatewayMetrics {
    // Request counters
    pub requests_total: AtomicU64,
    pub requests_allowed: AtomicU64,
    pub requests_throttled: AtomicU64,
    pub requests_blocked: AtomicU64,

    // Failures
    pub auth_failures: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub misconfigured: AtomicU64,
    pub payload_rejected: AtomicU64,
    pub aborted: AtomicU64,
    pub upstream_5xx: AtomicU64,

    // Latency tracking (simplified - in production use histograms)
    pub total_latency_ms: AtomicU64,
    pub request_count_for_latency: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authenticated request's outcome
    pub fn record_outcome(&self, outcome: Outcome, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let counter = match outcome {
            Outcome::Allowed { .. } => &self.requests_allowed,
            Outcome::Throttled { .. } => &self.requests_throttled,
            Outcome::Blocked => &self.requests_blocked,
            Outcome::UpstreamFailed { .. } => &self.upstream_failures,
            Outcome::Misconfigured => &self.misconfigured,
            Outcome::PayloadRejected => &self.payload_rejected,
            Outcome::Aborted { .. } => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Outcome::Allowed { status } | Outcome::Throttled { status } = outcome {
            if status >= 500 {
                self.upstream_5xx.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.request_count_for_latency
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Missing or unknown key; not attributable to any project
    pub fn record_auth_failure(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average latency in ms
    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.request_count_for_latency.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "metrics")]
    pub fn to_prometheus(&self) -> String {
        use prometheus::{Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};

        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("securex_edge_requests_total", "Requests by outcome"),
            &["outcome"],
        );
        let latency = Gauge::new(
            "securex_edge_average_latency_ms",
            "Average added plus upstream latency",
        );
        let (Ok(requests), Ok(latency)) = (requests, latency) else {
            return String::new();
        };

        for (label, counter) in [
            ("allowed", &self.requests_allowed),
            ("throttled", &self.requests_throttled),
            ("blocked", &self.requests_blocked),
            ("auth_failed", &self.auth_failures),
            ("upstream_failed", &self.upstream_failures),
            ("misconfigured", &self.misconfigured),
            ("payload_rejected", &self.payload_rejected),
            ("aborted", &self.aborted),
        ] {
            requests
                .with_label_values(&[label])
                .inc_by(counter.load(Ordering::Relaxed));
        }
        latency.set(self.average_latency_ms());

        let _ = registry.register(Box::new(requests));
        let _ = registry.register(Box::new(latency));

        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "allowed": self.requests_allowed.load(Ordering::Relaxed),
                "throttled": self.requests_throttled.load(Ordering::Relaxed),
                "blocked": self.requests_blocked.load(Ordering::Relaxed),
            },
            "failures": {
                "auth": self.auth_failures.load(Ordering::Relaxed),
                "upstream": self.upstream_failures.load(Ordering::Relaxed),
                "upstream_5xx": self.upstream_5xx.load(Ordering::Relaxed),
                "misconfigured": self.misconfigured.load(Ordering::Relaxed),
                "payload_rejected": self.payload_rejected.load(Ordering::Relaxed),
                "aborted": self.aborted.load(Ordering::Relaxed),
            },
            "latency": {
                "average_ms": self.average_latency_ms(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters() {
        let metrics = GatewayMetrics::new();

        metrics.record_outcome(Outcome::Allowed { status: 200 }, 10);
        metrics.record_outcome(Outcome::Throttled { status: 503 }, 310);
        metrics.record_outcome(Outcome::Blocked, 1);
        metrics.record_auth_failure();

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.requests_allowed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.requests_throttled.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.requests_blocked.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.auth_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.upstream_5xx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_average_latency() {
        let metrics = GatewayMetrics::new();

        metrics.record_outcome(Outcome::Allowed { status: 200 }, 100);
        metrics.record_outcome(Outcome::Allowed { status: 200 }, 200);
        metrics.record_outcome(Outcome::Allowed { status: 200 }, 300);

        assert!((metrics.average_latency_ms() - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_json_export() {
        let metrics = GatewayMetrics::new();
        metrics.record_outcome(Outcome::Aborted { throttled: false }, 5);
        let json = metrics.to_json();
        assert_eq!(json["requests"]["total"], 1);
        assert_eq!(json["failures"]["aborted"], 1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_export() {
        let metrics = GatewayMetrics::new();
        metrics.record_outcome(Outcome::Blocked, 1);
        let text = metrics.to_prometheus();
        assert!(text.contains("securex_edge_requests_total{outcome=\"blocked\"} 1"));
    }
}
