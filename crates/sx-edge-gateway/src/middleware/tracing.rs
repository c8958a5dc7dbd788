//! Request span layer.
//!
//! One `edge_request` span per inbound request carrying method, path and
//! final status. A W3C `traceparent` header, when present, is recorded on the
//! span so gateway logs can be joined with the caller's trace.

use axum::{body::Body, http::Request, response::Response};
use std::task::{Context, Poll};
use std::time::Instant;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument};

/// Tracing layer that creates spans for each request
#[derive(Clone, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

/// Tracing service
#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        let span = info_span!(
            "edge_request",
            http.method = %req.method(),
            http.target = %req.uri().path(),
            http.status = field::Empty,
            trace_id = field::Empty,
            parent_span_id = field::Empty,
            latency_ms = field::Empty,
        );
        if let Some((trace_id, parent_id)) = parse_traceparent(&req) {
            span.record("trace_id", trace_id.as_str());
            span.record("parent_span_id", parent_id.as_str());
        }

        let recorder = span.clone();
        Box::pin(
            async move {
                let started = Instant::now();
                let result = inner.call(req).await;
                if let Ok(response) = &result {
                    recorder.record("http.status", response.status().as_u16());
                }
                recorder.record("latency_ms", started.elapsed().as_millis() as u64);
                result
            }
            .instrument(span),
        )
    }
}

/// `(trace_id, parent_id)` from a W3C `traceparent` header
fn parse_traceparent<B>(req: &Request<B>) -> Option<(String, String)> {
    let traceparent = req.headers().get("traceparent")?.to_str().ok()?;

    // version-trace_id-parent_id-trace_flags
    let parts: Vec<&str> = traceparent.trim().split('-').collect();
    if parts.len() != 4 || parts[1].len() != 32 || parts[2].len() != 16 {
        return None;
    }
    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    if !is_hex(parts[1]) || !is_hex(parts[2]) {
        return None;
    }
    Some((parts[1].to_string(), parts[2].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_parsing() {
        let req = Request::builder()
            .header(
                "traceparent",
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            )
            .body(Body::empty())
            .unwrap();

        let (trace_id, parent) = parse_traceparent(&req).unwrap();
        assert_eq!(trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(parent, "b7ad6b7169203331");
    }

    #[test]
    fn test_invalid_traceparent() {
        let req = Request::builder()
            .header("traceparent", "invalid")
            .body(Body::empty())
            .unwrap();
        assert!(parse_traceparent(&req).is_none());

        let req = Request::builder()
            .header("traceparent", "00-zz-b7ad6b7169203331-01")
            .body(Body::empty())
            .unwrap();
        assert!(parse_traceparent(&req).is_none());
    }

    #[test]
    fn test_no_traceparent() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(parse_traceparent(&req).is_none());
    }
}
