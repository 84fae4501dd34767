//! Response returned by the request pipeline

use bytes::Bytes;
use fleetbook_common::cache::CacheEntry;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::errors::ApiError;

/// A successful response, fresh from the network or served from cache.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status of the response that produced `body`. Cached payloads report
    /// `200 OK`.
    pub status: StatusCode,
    pub etag: Option<String>,
    pub body: Bytes,
    /// The payload came from the response cache
    pub from_cache: bool,
    /// The payload was confirmed by a `304 Not Modified`
    pub revalidated: bool,
}

impl ApiResponse {
    pub(crate) fn from_entry(entry: &CacheEntry, revalidated: bool) -> Self {
        Self {
            status: StatusCode::OK,
            etag: entry.etag.clone(),
            body: entry.payload.clone(),
            from_cache: true,
            revalidated,
        }
    }

    /// Deserialize the body as JSON.
    ///
    /// An empty body (e.g. `204 No Content`) decodes as JSON `null`, so
    /// `()` and `Option<T>` targets succeed.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let result = if self.body.is_empty() {
            serde_json::from_value(serde_json::Value::Null)
        } else {
            serde_json::from_slice(&self.body)
        };
        result.map_err(|e| ApiError::Decode(format!("status {}: {}", self.status.as_u16(), e)))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
