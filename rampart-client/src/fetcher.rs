//! REST fetcher used as the network side of [`ClientCache`](crate::ClientCache).

use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::FetchError;

#[derive(Clone)]
pub struct RestFetcher {
    client: reqwest::Client,
    base_url: String,
}

/// The server's `{ success, data }` envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

impl RestFetcher {
    pub fn new(config: &ClientConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and return the raw body of a 2xx response.
    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.url(path);
        debug!(url = %url, "Fetching");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await.map_err(FetchError::from_reqwest)?;
            return Ok(body.to_vec());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        Err(FetchError::from_status(status.as_u16(), &text, retry_after))
    }

    /// GET `path` and return the serialized `data` field of the envelope.
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let body = self.get_bytes(path).await?;
        let envelope: Envelope = serde_json::from_slice(&body)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        if !envelope.success {
            return Err(FetchError::InvalidResponse(
                envelope
                    .message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        serde_json::to_vec(&envelope.data).map_err(|e| FetchError::InvalidResponse(e.to_string()))
    }
}

impl std::fmt::Debug for RestFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestFetcher")
            .field("base_url", &self.base_url)
            .finish()
    }
}
