//! Control-plane identity source over HTTP.
//!
//! `GET {base}/keys/validate?secret=...` with an optional service bearer
//! token. 404 means the secret is unknown; other non-2xx statuses are
//! failures, which the key store turns into "not found".

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::domain::error::{GatewayError, IdentityError};
use crate::ports::{IdentitySource, KeyValidation};

pub struct ControlPlaneClient {
    client: reqwest::Client,
    validate_url: String,
    token: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Ok(Self {
            client,
            validate_url: format!("{}/keys/validate", base_url.trim_end_matches('/')),
            token,
        })
    }
}

#[async_trait]
impl IdentitySource for ControlPlaneClient {
    async fn validate(&self, secret: &str) -> Result<Option<KeyValidation>, IdentityError> {
        let mut request = self
            .client
            .get(&self.validate_url)
            .query(&[("secret", secret)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IdentityError::Unreachable(e.without_url().to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let validation = response
                    .json::<KeyValidation>()
                    .await
                    .map_err(|e| IdentityError::Malformed(e.without_url().to_string()))?;
                debug!(project_id = %validation.project_id, "Control plane validated key");
                Ok(Some(validation))
            }
            status => Err(IdentityError::Status(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::HeaderMap, routing::get, Json, Router};
    use std::collections::HashMap;

    async fn spawn_control_plane() -> String {
        let app = Router::new().route(
            "/keys/validate",
            get(
                |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer svc-token");
                    if !authorized {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    match q.get("secret").map(String::as_str) {
                        Some("sk_live_good") => Ok(Json(serde_json::json!({
                            "projectId": "p1",
                            "upstreamBaseUrl": "https://api.example.com",
                            "active": true
                        }))),
                        _ => Err(StatusCode::NOT_FOUND),
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_validate_known_and_unknown() {
        let base = spawn_control_plane().await;
        let client = ControlPlaneClient::new(
            &format!("{}/", base),
            Some("svc-token".into()),
            Duration::from_secs(2),
        )
        .unwrap();

        let found = client.validate("sk_live_good").await.unwrap().unwrap();
        assert_eq!(found.project_id.as_str(), "p1");
        assert!(client.validate("sk_live_bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_service_token_is_an_error() {
        let base = spawn_control_plane().await;
        let client = ControlPlaneClient::new(&base, None, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.validate("sk_live_good").await,
            Err(IdentityError::Status(401))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_control_plane() {
        let client =
            ControlPlaneClient::new("http://127.0.0.1:1", None, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            client.validate("sk_live_good").await,
            Err(IdentityError::Unreachable(_))
        ));
    }
}
