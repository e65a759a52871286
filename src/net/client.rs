use reqwest::{header, Client};
use serde::de::DeserializeOwned;

use crate::store::CachedResponse;

use super::FetchError;

/// HTTP request timeout in seconds.
/// 30s allows for slow chart servers while failing fast enough that the
/// worker's degradation paths still feel responsive.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Content type assumed when the server sends none.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// HTTP fetcher for cache misses and update downloads.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    /// GET a URL and capture status, content type and body. Non-success
    /// statuses are returned as responses, not errors - callers branch
    /// on `is_success` the way the cache policies require.
    pub async fn get(&self, url: &str) -> Result<CachedResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        Self::into_cached(response).await
    }

    /// GET with intermediary caches bypassed. Used by the two-phase
    /// updater so Phase 1 always sees the server's current files.
    pub async fn get_no_store(&self, url: &str) -> Result<CachedResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .header(header::CACHE_CONTROL, "no-store")
            .header(header::PRAGMA, "no-cache")
            .send()
            .await?;
        Self::into_cached(response).await
    }

    /// GET and parse a JSON body, failing on non-success statuses.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.get(url).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                status: response.status,
                url: url.to_string(),
            });
        }
        serde_json::from_slice(&response.body).map_err(|e| FetchError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn into_cached(response: reqwest::Response) -> Result<CachedResponse, FetchError> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let body = response.bytes().await?.to_vec();
        Ok(CachedResponse::new(status, content_type, body))
    }
}
