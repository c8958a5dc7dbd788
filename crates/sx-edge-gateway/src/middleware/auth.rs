//! Bearer-token guard for the analysis listener.
//!
//! When a token is configured every route except `/health` requires
//! `Authorization: Bearer <token>`. The data plane never uses this layer; it
//! authenticates callers by project API key instead.

use axum::{body::Body, http::Request, response::Response};
use axum::http::{header, HeaderValue, StatusCode};
use std::sync::Arc;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::warn;

use crate::domain::error::{error_response, tokens};

/// Routes reachable without a token
const OPEN_PATHS: [&str; 1] = ["/health"];

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    token: Option<Arc<str>>,
}

impl AuthLayer {
    /// `None` leaves the listener open
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            token: self.token.clone(),
        }
    }
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    token: Option<Arc<str>>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let token = self.token.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Some(expected) = token {
                let open = OPEN_PATHS.contains(&req.uri().path());
                if !open && !has_valid_bearer(&req, &expected) {
                    warn!(path = %req.uri().path(), "Analysis request without valid token");
                    return Ok(unauthorized_response());
                }
            }
            inner.call(req).await
        })
    }
}

fn has_valid_bearer<B>(req: &Request<B>, expected: &str) -> bool {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_compare(token.trim(), expected))
}

/// Constant-time string comparison to prevent timing attacks
///
/// Both inputs are padded to the longer length with different fill bytes so
/// the comparison also fails, in constant time, when the lengths differ.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;

    let max_len = std::cmp::max(a.len(), b.len());

    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];

    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());

    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);

    (lengths_equal & contents_equal).into()
}

fn unauthorized_response() -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED, tokens::UNAUTHORIZED);
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}
