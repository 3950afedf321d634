//! Client for an authority node's HTTP surface.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::{
    error::AuthorityError,
    models::{AcquireKeyRequest, ExtendKeyRequest, GrantResponse, ReleaseKeyRequest},
};

use super::Authority;

/// Talks to one `octostore-quorum node` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    endpoint: String,
    base_url: Url,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpAuthority {
    /// Create a client for the node at `base_url`.
    ///
    /// Every request (connect included) is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthorityError> {
        let parsed = Url::parse(base_url)?;
        if parsed.cannot_be_a_base() {
            return Err(AuthorityError::UnsupportedScheme {
                endpoint: base_url.to_string(),
            });
        }
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            endpoint: base_url.to_string(),
            base_url: parsed,
            timeout,
            http_client,
        })
    }

    /// `{base}/keys/{key}/{action}` with the key percent-encoded as a single
    /// path segment.
    fn key_url(&self, key: &str, action: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["keys", key, action]);
        }
        url
    }

    async fn post<B: Serialize>(&self, key: &str, action: &str, body: &B) -> Result<bool, AuthorityError> {
        let response = self
            .http_client
            .post(self.key_url(key, action))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status != StatusCode::OK {
            let error_data: Value = response.json().await.unwrap_or_default();
            let message = error_data
                .get("details")
                .or_else(|| error_data.get("error"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(AuthorityError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let grant: GrantResponse = response.json().await?;
        Ok(grant.granted)
    }

    fn map_send_error(&self, error: reqwest::Error) -> AuthorityError {
        if error.is_timeout() {
            AuthorityError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if error.is_connect() {
            AuthorityError::Unavailable {
                endpoint: self.endpoint.clone(),
                reason: error.to_string(),
            }
        } else {
            AuthorityError::Http(error)
        }
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AuthorityError> {
        let body = AcquireKeyRequest {
            token: token.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.post(key, "acquire", &body).await
    }

    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AuthorityError> {
        let body = ExtendKeyRequest {
            token: token.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.post(key, "extend", &body).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, AuthorityError> {
        let body = ReleaseKeyRequest {
            token: token.to_string(),
        };
        self.post(key, "release", &body).await
    }
}
