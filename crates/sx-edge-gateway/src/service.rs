//! Edge gateway service - wires the components and runs both listeners.
//!
//! - data plane (`http`): `/__securex/health`, everything else is proxied
//!   through the [`GatewayDispatcher`];
//! - analysis (`analysis`): endpoint analysis for the dashboard, metrics and
//!   the key-cache invalidation hook used by the control plane.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::adapters::{ControlPlaneClient, HttpUpstream, InMemoryIdentitySource};
use crate::aggregator::TrafficAggregator;
use crate::dispatcher::{GatewayDispatcher, PipelineDeps};
use crate::domain::config::GatewayConfig;
use crate::domain::error::{error_response, tokens, GatewayError};
use crate::domain::types::ProjectId;
use crate::key_store::KeyStore;
use crate::middleware::{
    create_cors_layer, AuthLayer, CircuitBreakerManager, GatewayMetrics, RateLimitState,
    ReputationBook, TracingLayer,
};
use crate::ports::{IdentitySource, SystemTimeSource, TimeSource, Upstream};
use crate::projector::{parse_time_range, AnalysisProjector};

/// Reserved data-plane path; never proxied
pub const GATEWAY_HEALTH_PATH: &str = "/__securex/health";

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Rate-limit buckets idle this long are dropped
const BUCKET_MAX_IDLE: Duration = Duration::from_secs(300);

/// Edge gateway service state
pub struct EdgeGatewayService {
    config: GatewayConfig,
    deps: PipelineDeps,
    dispatcher: Arc<GatewayDispatcher>,
    projector: Arc<AnalysisProjector>,
    shutdown: watch::Sender<bool>,
}

impl EdgeGatewayService {
    /// Validate the config and build the production adapters.
    ///
    /// A configured control plane takes precedence over static keys.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let identity: Arc<dyn IdentitySource> = match &config.key_store.control_plane_url {
            Some(url) => {
                info!(control_plane = %url, "Resolving keys against the control plane");
                Arc::new(ControlPlaneClient::new(
                    url,
                    config.key_store.control_plane_token.clone(),
                    config.key_store.lookup_timeout,
                )?)
            }
            None => {
                info!(
                    keys = config.key_store.static_keys.len(),
                    "Resolving keys from static configuration"
                );
                Arc::new(
                    InMemoryIdentitySource::from_static_keys(&config.key_store.static_keys)
                        .map_err(|e| GatewayError::Config(e.to_string()))?,
                )
            }
        };
        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);

        Ok(Self::with_components(
            config,
            identity,
            upstream,
            Arc::new(SystemTimeSource),
        ))
    }

    /// Build the service around caller-supplied adapters. The config is
    /// taken as already validated.
    pub fn with_components(
        config: GatewayConfig,
        identity: Arc<dyn IdentitySource>,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let aggregator = Arc::new(TrafficAggregator::new(
            config.aggregator.clone(),
            Arc::clone(&clock),
        ));
        let deps = PipelineDeps {
            key_store: Arc::new(KeyStore::new(identity, config.key_store.clone())),
            aggregator: Arc::clone(&aggregator),
            upstream,
            rate_limits: Arc::new(RateLimitState::new(config.rate_limit.clone())),
            reputation: Arc::new(ReputationBook::new(clock)),
            circuits: Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone())),
            metrics: Arc::new(GatewayMetrics::new()),
        };
        let dispatcher = Arc::new(GatewayDispatcher::new(&config, deps.clone()));
        let projector = Arc::new(AnalysisProjector::new(
            aggregator,
            config.analysis_thresholds.clone(),
            &config.mitigation,
            config.aggregator.retention,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            deps,
            dispatcher,
            projector,
            shutdown,
        }
    }

    /// Run both listeners until [`shutdown`](Self::shutdown) is called.
    pub async fn start(&self) -> Result<(), GatewayError> {
        info!("Starting SecureX edge gateway...");

        let http_addr = self.config.http_addr();
        let http_listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{}: {}", http_addr, e)))?;

        let analysis_handle = if self.config.analysis.enabled {
            let addr = self.config.analysis_addr();
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| GatewayError::Bind(format!("{}: {}", addr, e)))?;
            info!(addr = %addr, "Starting analysis server");
            let router = self.analysis_router();
            let stop = self.shutdown.subscribe();
            Some(tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(wait_for_shutdown(stop))
                    .await
            }))
        } else {
            None
        };

        self.start_maintenance_tasks();

        info!(addr = %http_addr, "Starting data-plane server");
        let served = axum::serve(
            http_listener,
            self.gateway_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown.subscribe()))
        .await;

        if let Err(e) = &served {
            error!(error = %e, "Data-plane server error");
            self.shutdown();
        }
        if let Some(handle) = analysis_handle {
            match handle.await {
                Ok(Err(e)) => error!(error = %e, "Analysis server error"),
                Err(e) => error!(error = %e, "Analysis server task failed"),
                Ok(Ok(())) => {}
            }
        }

        info!("SecureX edge gateway stopped");
        served.map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.deps.metrics)
    }

    pub fn key_store(&self) -> Arc<KeyStore> {
        Arc::clone(&self.deps.key_store)
    }

    pub fn aggregator(&self) -> Arc<TrafficAggregator> {
        Arc::clone(&self.deps.aggregator)
    }

    pub fn projector(&self) -> Arc<AnalysisProjector> {
        Arc::clone(&self.projector)
    }

    /// Data-plane router
    pub fn gateway_router(&self) -> Router {
        Router::new()
            .route(GATEWAY_HEALTH_PATH, get(gateway_health))
            .fallback(proxy)
            .with_state(Arc::clone(&self.dispatcher))
            .layer(TracingLayer::new())
    }

    /// Analysis router (dashboard and control plane)
    pub fn analysis_router(&self) -> Router {
        let state = AnalysisState {
            deps: self.deps.clone(),
            projector: Arc::clone(&self.projector),
        };

        Router::new()
            .route("/health", get(analysis_health))
            .route(
                "/projects/:project_id/endpoint-analysis",
                get(endpoint_analysis),
            )
            .route("/metrics", get(metrics))
            .route("/internal/keys/invalidate", post(invalidate_keys))
            .with_state(state)
            .layer(AuthLayer::new(self.config.analysis.api_token.clone()))
            .layer(create_cors_layer(&self.config.cors))
            .layer(TracingLayer::new())
    }

    /// Periodic purges of every per-key map
    fn start_maintenance_tasks(&self) {
        let deps = self.deps.clone();
        let mut stop = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let keys = deps.key_store.purge_expired();
                        let buckets = deps.rate_limits.cleanup(BUCKET_MAX_IDLE);
                        let clients = deps.reputation.cleanup();
                        let windows = deps.aggregator.purge_idle();
                        debug!(keys, buckets, clients, windows, "Maintenance pass");
                    }
                    _ = stop.wait_for(|stopped| *stopped) => break,
                }
            }
        });
    }
}

async fn wait_for_shutdown(mut stop: watch::Receiver<bool>) {
    // a dropped sender also ends the wait
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn proxy(State(dispatcher): State<Arc<GatewayDispatcher>>, req: Request) -> Response {
    dispatcher.handle(req).await
}

async fn gateway_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Analysis handler state
#[derive(Clone)]
struct AnalysisState {
    deps: PipelineDeps,
    projector: Arc<AnalysisProjector>,
}

async fn analysis_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::gateway_version(),
    }))
}

#[derive(Debug, Deserialize)]
struct AnalysisQuery {
    time_range: Option<String>,
}

async fn endpoint_analysis(
    State(state): State<AnalysisState>,
    Path(project_id): Path<String>,
    Query(query): Query<AnalysisQuery>,
) -> Response {
    let time_range = match query.time_range.as_deref() {
        None => None,
        Some(raw) => match parse_time_range(raw) {
            Some(range) => Some(range),
            None => return error_response(StatusCode::BAD_REQUEST, tokens::BAD_REQUEST),
        },
    };

    let records = state
        .projector
        .project(&ProjectId::new(project_id), time_range);
    Json(records).into_response()
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn metrics(State(state): State<AnalysisState>, Query(query): Query<MetricsQuery>) -> Response {
    let deps = &state.deps;
    match query.format.as_deref() {
        None | Some("json") => {}
        #[cfg(feature = "metrics")]
        Some("prometheus") => {
            return (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                deps.metrics.to_prometheus(),
            )
                .into_response();
        }
        Some(_) => return error_response(StatusCode::BAD_REQUEST, tokens::BAD_REQUEST),
    }

    let mut body = deps.metrics.to_json();
    body["key_store"] = serde_json::to_value(deps.key_store.stats()).unwrap_or_default();
    body["circuits"] = serde_json::to_value(deps.circuits.get_stats()).unwrap_or_default();
    body["tracked"] = serde_json::json!({
        "endpoint_windows": deps.aggregator.window_count(),
        "rate_limit_buckets": deps.rate_limits.bucket_count(),
        "clients": deps.reputation.tracked_clients(),
    });
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(body),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    project_id: Option<String>,
    #[serde(default)]
    all: bool,
}

async fn invalidate_keys(
    State(state): State<AnalysisState>,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    let key_store = &state.deps.key_store;
    let invalidated = match (request.all, request.project_id) {
        (true, _) => key_store.invalidate_all(),
        (false, Some(project_id)) => key_store.invalidate_project(&ProjectId::new(project_id)),
        (false, None) => return error_response(StatusCode::BAD_REQUEST, tokens::BAD_REQUEST),
    };
    Json(serde_json::json!({ "invalidated": invalidated })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::StaticKey;

    fn static_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.key_store.static_keys = vec![StaticKey {
            project_id: "p1".into(),
            project_name: "shop".into(),
            upstream_base_url: "https://api.shop.test".into(),
            secret: "sk_live_static".into(),
        }];
        config
    }

    #[test]
    fn test_new_validates_config() {
        assert!(matches!(
            EdgeGatewayService::new(GatewayConfig::default()),
            Err(GatewayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_new_with_static_keys() {
        let service = EdgeGatewayService::new(static_config()).unwrap();
        let resolved = service.key_store().resolve("sk_live_static").await.unwrap();
        assert_eq!(resolved.project_id, ProjectId::new("p1"));
        assert!(service.key_store().resolve("sk_live_other").await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = static_config();
        config.http.host = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        config.http.port = 0;
        config.analysis.enabled = false;
        let service = Arc::new(EdgeGatewayService::new(config).unwrap());

        let runner = Arc::clone(&service);
        let handle = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
