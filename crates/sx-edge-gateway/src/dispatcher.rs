//! Data-plane request pipeline.
//!
//! ```text
//! x-api-key ─► KeyStore ─► endpoint window ─► risk score ─► decision
//!                                                            │
//!            ┌───────────────────────────────────────────────┤
//!            ▼                                               ▼
//!      BLOCK: 429                          ALLOW / THROTTLE: forward upstream
//!                                                  (THROTTLE holds response)
//!            │                                               │
//!            └──────────────► one aggregator record ◄────────┘
//! ```
//!
//! Every request that resolves to a project produces exactly one record in
//! the traffic aggregator, including upstream failures and callers that
//! disconnect mid-flight (recorded as aborted when the pipeline future is
//! dropped). Requests without a valid key are answered with 401 before any
//! project is known and only show up in the gateway counters.

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::adapters::upstream::{build_upstream_url, forwardable_request_headers};
use crate::aggregator::TrafficAggregator;
use crate::domain::config::{GatewayConfig, MitigationConfig, RiskConfig};
use crate::domain::endpoint::{has_path_traversal, normalize_endpoint};
use crate::domain::error::{EdgeError, UpstreamError};
use crate::domain::mitigation::{decide, DecisionKind, MitigationDecision};
use crate::domain::risk;
use crate::domain::types::{
    AnomalyFlags, EndpointKey, KeyHash, Outcome, ProjectId, RequestContext, ResolvedKey,
    API_KEY_HEADER,
};
use crate::key_store::KeyStore;
use crate::middleware::{CircuitBreakerManager, GatewayMetrics, RateLimitState, ReputationBook};
use crate::ports::{ForwardRequest, Upstream, UpstreamResponse};

/// Shared state the pipeline reads and updates
#[derive(Clone)]
pub struct PipelineDeps {
    pub key_store: Arc<KeyStore>,
    pub aggregator: Arc<TrafficAggregator>,
    pub upstream: Arc<dyn Upstream>,
    pub rate_limits: Arc<RateLimitState>,
    pub reputation: Arc<ReputationBook>,
    pub circuits: Arc<CircuitBreakerManager>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Runs the per-request pipeline
pub struct GatewayDispatcher {
    deps: PipelineDeps,
    risk: RiskConfig,
    mitigation: MitigationConfig,
    max_body_size: usize,
}

impl GatewayDispatcher {
    pub fn new(config: &GatewayConfig, deps: PipelineDeps) -> Self {
        Self {
            deps,
            risk: config.risk.clone(),
            mitigation: config.mitigation.clone(),
            max_body_size: config.upstream.max_body_size,
        }
    }

    /// Handle one inbound data-plane request.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let started = Instant::now();
        let arrived_at = self.deps.aggregator.now_millis();

        // (1) key header
        let Some(secret) = api_key(req.headers()) else {
            self.deps.metrics.record_auth_failure();
            debug!(path = %req.uri().path(), "Request without api key");
            return EdgeError::InvalidKey.into_response();
        };

        // (2) resolve
        let Some(resolved) = self.deps.key_store.resolve(&secret).await else {
            self.deps.metrics.record_auth_failure();
            debug!(key = %KeyHash::of(&secret).short(), "Unknown or revoked api key");
            return EdgeError::InvalidKey.into_response();
        };
        let ResolvedKey {
            project_id,
            upstream_base_url,
        } = resolved;

        let client_ip = self.deps.rate_limits.client_ip(&req);
        let endpoint = normalize_endpoint(req.uri().path());
        let mut recorder = OutcomeRecorder {
            deps: &self.deps,
            project_id: project_id.clone(),
            endpoint: endpoint.clone(),
            risk_score: 0.0,
            throttled: false,
            arrived_at,
            started,
            done: false,
        };

        // (3) score against the endpoint window
        let flags = self.anomaly_flags(&req);
        let context = RequestContext {
            client_ip,
            client_reputation: self.deps.reputation.score(client_ip),
            flags,
        };
        let window = self.deps.aggregator.snapshot(
            &EndpointKey::new(project_id.clone(), endpoint.as_str()),
            self.risk.burst_window_secs,
        );
        let risk_score = risk::score(&context, &window, &self.risk);

        // (4) decide
        let rate = self.deps.rate_limits.check(&project_id, client_ip);
        let decision = decide(risk_score, rate, &self.mitigation, arrived_at);
        recorder.risk_score = decision.risk_score;
        recorder.throttled = decision.kind == DecisionKind::Throttle;
        self.deps.reputation.record(client_ip, decision.kind);

        debug!(
            project_id = %project_id,
            endpoint = %endpoint,
            client_ip = %client_ip,
            decision = decision.kind.as_str(),
            risk_score = decision.risk_score,
            current_rpm = window.current_rpm,
            ?rate,
            "Mitigation decision"
        );

        // (5) branch
        if decision.kind == DecisionKind::Block {
            info!(
                project_id = %project_id,
                endpoint = %endpoint,
                client_ip = %client_ip,
                risk_score = decision.risk_score,
                "Request blocked"
            );
            recorder.finish(Outcome::Blocked);
            return EdgeError::RateLimited {
                retry_after_secs: retry_after_secs(decision.retry_after),
            }
            .into_response();
        }

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(body) => body,
            Err(e) => {
                debug!(project_id = %project_id, endpoint = %endpoint, error = %e, "Rejecting request body");
                recorder.finish(Outcome::PayloadRejected);
                return EdgeError::PayloadTooLarge(self.max_body_size).into_response();
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let url = match build_upstream_url(&upstream_base_url, path_and_query) {
            Ok(url) => url,
            Err(e) => {
                error!(
                    project_id = %project_id,
                    error = %e,
                    "Project upstream is misconfigured"
                );
                recorder.finish(Outcome::Misconfigured);
                return EdgeError::from(e).into_response();
            }
        };

        let throttled = recorder.throttled;
        if !self.deps.circuits.should_allow(&project_id) {
            debug!(project_id = %project_id, "Upstream circuit open");
            recorder.finish(Outcome::UpstreamFailed { throttled });
            return EdgeError::from(UpstreamError::CircuitOpen).into_response();
        }

        let forwarded = self
            .deps
            .upstream
            .forward(ForwardRequest {
                method: parts.method,
                url,
                headers: forwardable_request_headers(&parts.headers),
                body,
            })
            .await;

        match forwarded {
            Ok(upstream) => {
                self.deps.circuits.record_success(&project_id);
                self.relay(upstream, &decision, recorder).await
            }
            Err(e) => {
                if matches!(
                    e,
                    UpstreamError::Connect(_) | UpstreamError::Timeout(_) | UpstreamError::Transport(_)
                ) {
                    self.deps.circuits.record_failure(&project_id);
                }
                warn!(
                    project_id = %project_id,
                    endpoint = %endpoint,
                    error = %e,
                    "Upstream forward failed"
                );
                recorder.finish(Outcome::UpstreamFailed { throttled });
                EdgeError::from(e).into_response()
            }
        }
    }

    /// Hold a throttled response for the injected delay, then relay it as-is.
    async fn relay(
        &self,
        upstream: UpstreamResponse,
        decision: &MitigationDecision,
        recorder: OutcomeRecorder<'_>,
    ) -> Response {
        let status = upstream.status.as_u16();
        let outcome = match decision.kind {
            DecisionKind::Throttle => {
                tokio::time::sleep(decision.delay).await;
                Outcome::Throttled { status }
            }
            _ => Outcome::Allowed { status },
        };
        recorder.finish(outcome);

        let mut response = Response::new(Body::from(upstream.body));
        *response.status_mut() = upstream.status;
        *response.headers_mut() = upstream.headers;
        response
    }

    fn anomaly_flags<B>(&self, req: &Request<B>) -> AnomalyFlags {
        let declared_len = req
            .headers()
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        AnomalyFlags {
            missing_user_agent: !req.headers().contains_key(axum::http::header::USER_AGENT),
            path_traversal: has_path_traversal(
                req.uri().path_and_query().map_or("", |pq| pq.as_str()),
            ),
            oversized_body: declared_len.is_some_and(|len| len > self.max_body_size),
        }
    }
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Writes the request's single aggregator record.
///
/// Dropped without `finish` means the pipeline future was cancelled, which
/// is recorded as aborted.
struct OutcomeRecorder<'a> {
    deps: &'a PipelineDeps,
    project_id: ProjectId,
    endpoint: String,
    risk_score: f64,
    throttled: bool,
    arrived_at: i64,
    started: Instant,
    done: bool,
}

impl OutcomeRecorder<'_> {
    fn finish(mut self, outcome: Outcome) {
        self.write(outcome);
    }

    fn write(&mut self, outcome: Outcome) {
        if self.done {
            return;
        }
        self.done = true;

        let latency = self.started.elapsed();
        self.deps.aggregator.record(
            &self.project_id,
            &self.endpoint,
            outcome,
            self.risk_score,
            self.arrived_at,
        );
        self.deps
            .metrics
            .record_outcome(outcome, latency.as_millis() as u64);

        debug!(
            project_id = %self.project_id,
            endpoint = %self.endpoint,
            outcome = outcome.label(),
            latency_ms = latency.as_millis() as u64,
            "Request recorded"
        );
    }
}

impl Drop for OutcomeRecorder<'_> {
    fn drop(&mut self) {
        if !self.done {
            info!(
                project_id = %self.project_id,
                endpoint = %self.endpoint,
                "Caller went away before the response"
            );
            let throttled = self.throttled;
            self.write(Outcome::Aborted { throttled });
        }
    }
}

/// Retry-After seconds for a BLOCK decision, never below one
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_secs_f64().ceil() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryIdentitySource;
    use crate::domain::config::KeyStoreConfig;
    use crate::domain::error::IdentityError;
    use crate::ports::{IdentitySource, KeyValidation, ManualClock, TimeSource};
    use async_trait::async_trait;
    use axum::http::{HeaderValue, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: i64 = 1_704_110_400_000;

    /// Upstream stub that counts calls and echoes the forwarded request
    #[derive(Default)]
    struct EchoUpstream {
        calls: AtomicUsize,
        fail_with: Option<UpstreamError>,
        delay: Duration,
    }

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn forward(&self, request: ForwardRequest) -> Result<UpstreamResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            let mut headers = HeaderMap::new();
            headers.insert("x-upstream-url", HeaderValue::from_str(&request.url).unwrap());
            headers.insert(
                "x-saw-api-key",
                HeaderValue::from_static(if request.headers.contains_key(API_KEY_HEADER) {
                    "yes"
                } else {
                    "no"
                }),
            );
            Ok(UpstreamResponse {
                status: StatusCode::CREATED,
                headers,
                body: request.body,
            })
        }
    }

    struct FixedSource(String);

    #[async_trait]
    impl IdentitySource for FixedSource {
        async fn validate(&self, secret: &str) -> Result<Option<KeyValidation>, IdentityError> {
            Ok((secret == "sk_fixed").then(|| KeyValidation {
                project_id: ProjectId::new("p-fixed"),
                upstream_base_url: self.0.clone(),
                active: true,
            }))
        }
    }

    struct Harness {
        dispatcher: GatewayDispatcher,
        deps: PipelineDeps,
        upstream: Arc<EchoUpstream>,
    }

    fn harness(
        source: Arc<dyn IdentitySource>,
        upstream: EchoUpstream,
        tweak: impl FnOnce(&mut GatewayConfig),
    ) -> Harness {
        let mut config = GatewayConfig::default();
        config.rate_limit.enabled = false;
        tweak(&mut config);

        let clock: Arc<dyn TimeSource> = Arc::new(ManualClock::new(T0));
        let upstream = Arc::new(upstream);
        let deps = PipelineDeps {
            key_store: Arc::new(KeyStore::new(source, KeyStoreConfig::default())),
            aggregator: Arc::new(TrafficAggregator::new(
                config.aggregator.clone(),
                Arc::clone(&clock),
            )),
            upstream: Arc::clone(&upstream) as Arc<dyn Upstream>,
            rate_limits: Arc::new(RateLimitState::new(config.rate_limit.clone())),
            reputation: Arc::new(ReputationBook::new(Arc::clone(&clock))),
            circuits: Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone())),
            metrics: Arc::new(GatewayMetrics::new()),
        };
        Harness {
            dispatcher: GatewayDispatcher::new(&config, deps.clone()),
            deps,
            upstream,
        }
    }

    fn project_source() -> (Arc<InMemoryIdentitySource>, ProjectId, String) {
        let source = Arc::new(InMemoryIdentitySource::new());
        let project = source
            .create_project("shop", "https://api.shop.test")
            .unwrap();
        let (_, secret) = source.issue_key(&project.id).unwrap();
        (source, project.id, secret)
    }

    fn request(path: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("user-agent", "test-client/1.0")
            .header("x-forwarded-for", "203.0.113.7");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from("payload")).unwrap()
    }

    fn recorded(h: &Harness, project_id: &ProjectId) -> u64 {
        h.deps
            .aggregator
            .endpoint_stats(project_id, 60)
            .iter()
            .map(|s| s.range.requests)
            .sum()
    }

    #[tokio::test]
    async fn test_missing_key_is_401_without_upstream() {
        let (source, _, _) = project_source();
        let h = harness(source, EchoUpstream::default(), |_| {});

        let response = h.dispatcher.handle(request("/orders", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = h.dispatcher.handle(request("/orders", Some("sk_live_nope"))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.deps.aggregator.window_count(), 0);
        assert_eq!(
            h.deps.metrics.auth_failures.load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_allowed_request_is_forwarded_and_recorded_once() {
        let (source, project_id, secret) = project_source();
        let h = harness(source, EchoUpstream::default(), |_| {});

        let response = h
            .dispatcher
            .handle(request("/orders/42?expand=items", Some(secret.as_str())))
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()["x-upstream-url"],
            "https://api.shop.test/orders/42?expand=items"
        );
        assert_eq!(response.headers()["x-saw-api-key"], "no");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"payload");

        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorded(&h, &project_id), 1);
        let stats = h.deps.aggregator.endpoint_stats(&project_id, 60);
        assert_eq!(stats[0].endpoint, "/orders/{id}");
    }

    #[tokio::test]
    async fn test_block_never_contacts_upstream() {
        let (source, project_id, secret) = project_source();
        // every score blocks
        let h = harness(source, EchoUpstream::default(), |c| {
            c.risk.cold_start_score = 1.0;
        });

        let response = h.dispatcher.handle(request("/orders", Some(secret.as_str()))).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);

        let stats = h.deps.aggregator.endpoint_stats(&project_id, 60);
        assert_eq!(stats[0].range.blocked, 1);
    }

    #[tokio::test]
    async fn test_throttle_holds_response() {
        let (source, project_id, secret) = project_source();
        let h = harness(source, EchoUpstream::default(), |c| {
            c.risk.cold_start_score = 0.6;
            c.mitigation.throttle_delay = Duration::from_millis(80);
        });

        let started = Instant::now();
        let response = h.dispatcher.handle(request("/search", Some(secret.as_str()))).await;
        let elapsed = started.elapsed();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(elapsed >= Duration::from_millis(80), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "elapsed {:?}", elapsed);

        let stats = h.deps.aggregator.endpoint_stats(&project_id, 60);
        assert_eq!(stats[0].range.throttled, 1);
    }

    #[tokio::test]
    async fn test_upstream_failures_map_to_gateway_statuses() {
        let (source, project_id, secret) = project_source();
        let h = harness(
            source.clone(),
            EchoUpstream {
                fail_with: Some(UpstreamError::Connect("refused".into())),
                ..Default::default()
            },
            |_| {},
        );
        let response = h.dispatcher.handle(request("/orders", Some(secret.as_str()))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(recorded(&h, &project_id), 1);

        let h = harness(
            source,
            EchoUpstream {
                fail_with: Some(UpstreamError::Timeout(10_000)),
                ..Default::default()
            },
            |_| {},
        );
        let response = h.dispatcher.handle(request("/orders", Some(secret.as_str()))).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(recorded(&h, &project_id), 1);
        let stats = h.deps.aggregator.endpoint_stats(&project_id, 60);
        assert_eq!(stats[0].range.errors, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let (source, _, secret) = project_source();
        let h = harness(
            source,
            EchoUpstream {
                fail_with: Some(UpstreamError::Connect("refused".into())),
                ..Default::default()
            },
            |c| c.circuit_breaker.failure_threshold = 2,
        );

        for _ in 0..2 {
            h.dispatcher.handle(request("/orders", Some(secret.as_str()))).await;
        }
        let response = h.dispatcher.handle(request("/orders", Some(secret.as_str()))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_misconfigured_upstream_is_500_without_detail() {
        let h = harness(
            Arc::new(FixedSource("ftp://files.internal".into())),
            EchoUpstream::default(),
            |_| {},
        );

        let response = h.dispatcher.handle(request("/orders", Some("sk_fixed"))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"internal_error"}"#);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(recorded(&h, &ProjectId::new("p-fixed")), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let (source, project_id, secret) = project_source();
        let h = harness(source, EchoUpstream::default(), |c| {
            c.upstream.max_body_size = 4;
        });

        let response = h.dispatcher.handle(request("/upload", Some(secret.as_str()))).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(recorded(&h, &project_id), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_recorded_as_aborted() {
        let (source, project_id, secret) = project_source();
        let h = harness(
            source,
            EchoUpstream {
                delay: Duration::from_secs(5),
                ..Default::default()
            },
            |_| {},
        );

        let pending = h.dispatcher.handle(request("/slow", Some(secret.as_str())));
        let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(result.is_err());

        assert_eq!(recorded(&h, &project_id), 1);
        assert_eq!(
            h.deps.metrics.aborted.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(2500)), 3);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
