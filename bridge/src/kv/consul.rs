//! Consul HTTP KV client.
//!
//! Uses Consul blocking queries (`?index=<n>&wait=<s>s`) for the long poll and
//! the `X-Consul-Index` response header as the version marker.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::{KvError, KvSnapshot, KvStore};

const CONNECT_TIMEOUT_MS: u64 = 2_000;
const REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Added on top of the blocking wait; Consul may overshoot the wait by up to wait/16.
const BLOCKING_GRACE_MS: u64 = 5_000;
const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Deserialize)]
struct ConsulEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Client for the Consul `/v1/kv` endpoints.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    http_client: Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulKv {
    /// Creates a client for the agent at `base_url` (e.g. `http://consul:8500`).
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, KvError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_millis(CONNECT_TIMEOUT_MS))
            .build()
            .map_err(|e| KvError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(ConsulKv {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn endpoint(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn read_tree(&self, request: RequestBuilder) -> Result<KvSnapshot, KvError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;

        let version = consul_index(&response)?;

        // 404 on a recursive read means "no keys under this prefix".
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(KvSnapshot {
                entries: Vec::new(),
                version,
            });
        }

        let response = ensure_success(response).await?;
        let raw: Vec<ConsulEntry> = response
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;

        Ok(KvSnapshot {
            entries: decode_entries(raw),
            version,
        })
    }
}

#[async_trait]
impl KvStore for ConsulKv {
    async fn fetch(&self, prefix: &str) -> Result<KvSnapshot, KvError> {
        let request = self
            .http_client
            .get(self.endpoint(prefix))
            .query(&[("recurse", "true")])
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS));
        self.read_tree(request).await
    }

    async fn blocking_fetch(
        &self,
        prefix: &str,
        since: u64,
        wait: Duration,
    ) -> Result<KvSnapshot, KvError> {
        let wait_secs = wait.as_secs().max(1);
        debug!("Consul blocking read on '{}' since index {}", prefix, since);

        let request = self
            .http_client
            .get(self.endpoint(prefix))
            .query(&[
                ("recurse", "true".to_string()),
                ("index", since.to_string()),
                ("wait", format!("{}s", wait_secs)),
            ])
            .timeout(Duration::from_secs(wait_secs) + Duration::from_millis(BLOCKING_GRACE_MS));
        self.read_tree(request).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        let request = self
            .http_client
            .put(self.endpoint(key))
            .body(value.to_string())
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError> {
        let mut request = self
            .http_client
            .delete(self.endpoint(key))
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS));
        if recursive {
            request = request.query(&[("recurse", "true")]);
        }
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Reads `X-Consul-Index`. Consul documents index 0 as invalid; it is clamped to 1.
fn consul_index(response: &Response) -> Result<u64, KvError> {
    let header = response
        .headers()
        .get(INDEX_HEADER)
        .ok_or_else(|| KvError::Decode(format!("missing {} header", INDEX_HEADER)))?;
    let index = header
        .to_str()
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| KvError::Decode(format!("invalid {} header", INDEX_HEADER)))?;
    Ok(index.max(1))
}

async fn ensure_success(response: Response) -> Result<Response, KvError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(KvError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Decodes base64 values. Folder keys (null values) are skipped, and so are
/// values that are not base64-encoded UTF-8, with a warning; one bad key must
/// not hide the rest of the tree.
fn decode_entries(raw: Vec<ConsulEntry>) -> Vec<(String, String)> {
    raw.into_iter()
        .filter_map(|entry| {
            let encoded = entry.value?;
            match decode_value(&encoded) {
                Ok(value) => Some((entry.key, value)),
                Err(e) => {
                    warn!("Skipping undecodable KV entry '{}': {}", entry.key, e);
                    None
                }
            }
        })
        .collect()
}

fn decode_value(encoded: &str) -> Result<String, String> {
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}
