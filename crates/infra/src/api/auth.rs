//! Token refresh over HTTP
//!
//! Implements [`TokenRefresher`] against the API's refresh endpoint. The
//! refresh call bypasses the request pipeline: it carries no bearer token,
//! is never cached, and is not retried here (the coordinator decides what a
//! failure means for the session).

use async_trait::async_trait;
use fleetbook_common::auth::{RefreshError, TokenRefresher, TokenSet};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::http::HttpClient;

/// Default path of the refresh endpoint, relative to the API base URL
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refreshes tokens with `POST {endpoint}` and a JSON `refresh_token` body.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    http: HttpClient,
    endpoint: Url,
}

impl HttpTokenRefresher {
    pub fn new(http: HttpClient, endpoint: Url) -> Self {
        Self { http, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Statuses that mean the refresh token itself is no longer accepted
fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, RefreshError> {
        debug!("Requesting token refresh");

        let request = self
            .http
            .request(Method::POST, self.endpoint.clone())
            .json(&RefreshRequest { refresh_token });

        let response = self
            .http
            .send(request)
            .await
            .map_err(|err| RefreshError::Unavailable(err.to_string()))?;

        let status = response.status();
        if is_rejection(status) {
            warn!(status = status.as_u16(), "Refresh token rejected");
            return Err(RefreshError::Rejected { status: status.as_u16() });
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Refresh endpoint failed");
            return Err(RefreshError::Unavailable(format!("refresh endpoint returned {status}")));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::Unavailable(format!("invalid refresh response: {err}")))?;

        info!(rotated = body.refresh_token.is_some(), "Token refresh succeeded");
        Ok(TokenSet::new(body.access_token, body.refresh_token, body.expires_in))
    }
}
