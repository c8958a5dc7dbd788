//! Upstream forwarding over reqwest.
//!
//! One attempt with the request timeout; on a connect failure (nothing was
//! sent) at most one retry with the shorter retry timeout. Timeouts and
//! failures after the request was sent are never retried. Redirects are
//! relayed to the caller, not followed. Response bodies larger than
//! `max_body_size` are a transport failure.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::config::UpstreamConfig;
use crate::domain::error::{GatewayError, UpstreamError};
use crate::domain::types::API_KEY_HEADER;
use crate::ports::{ForwardRequest, Upstream, UpstreamResponse};

/// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct HttpUpstream {
    client: reqwest::Client,
    request_timeout: Duration,
    retry_timeout: Duration,
    max_retries: u32,
    max_body_size: usize,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
            retry_timeout: config.retry_timeout,
            max_retries: config.max_retries.min(1),
            max_body_size: config.max_body_size,
        })
    }

    async fn attempt(
        &self,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut response = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let body = self.read_body(&mut response, timeout).await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn read_body(
        &self,
        response: &mut reqwest::Response,
        timeout: Duration,
    ) -> Result<Bytes, UpstreamError> {
        let limit = self.max_body_size;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(oversized(limit));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(e, timeout))? {
            if body.len() + chunk.len() > limit {
                return Err(oversized(limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn oversized(limit: usize) -> UpstreamError {
    warn!(limit, "Upstream response body over limit");
    UpstreamError::Transport(format!("response body exceeds {} bytes", limit))
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: ForwardRequest) -> Result<UpstreamResponse, UpstreamError> {
        match self.attempt(&request, self.request_timeout).await {
            Err(UpstreamError::Connect(reason)) if self.max_retries > 0 => {
                debug!(reason = %reason, "Upstream connect failed, retrying once");
                self.attempt(&request, self.retry_timeout).await
            }
            other => other,
        }
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(timeout.as_millis() as u64)
    } else if e.is_connect() {
        UpstreamError::Connect(e.without_url().to_string())
    } else {
        warn!(error = %e, "Upstream transport error");
        UpstreamError::Transport(e.without_url().to_string())
    }
}

/// `{base}{path_and_query}`; only absolute http(s) bases are accepted.
pub fn build_upstream_url(base: &str, path_and_query: &str) -> Result<String, UpstreamError> {
    let base = base.trim().trim_end_matches('/');
    let path = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{}", path_and_query)
    };
    let url = format!("{}{}", base, path);

    match reqwest::Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(url),
        _ => Err(UpstreamError::InvalidUrl(base.to_string())),
    }
}

/// Caller headers minus the API key, `Host`, `Content-Length` and hop-by-hop
/// headers.
pub fn forwardable_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(API_KEY_HEADER);
    out.remove(header::HOST);
    out
}

/// Drop hop-by-hop headers, any header named in `Connection`, and
/// `Content-Length` (recomputed from the relayed body).
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    for name in connection_listed {
        out.remove(name.as_str());
    }
    out.remove(header::CONTENT_LENGTH);
    out
}
