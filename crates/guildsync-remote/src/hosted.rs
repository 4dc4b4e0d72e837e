//! Hosted content API backend.
//!
//! Speaks the GitHub-contents-style protocol: `GET {api}/{path}` returns the
//! blob as base64 plus its `sha` (the version token), `PUT {api}/{path}`
//! carries the new base64 body plus the expected `sha` and fails with 409 on
//! a stale token. 404 means absent, 5xx means transient.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::traits::{FetchedBlob, RemoteBlobStore, VersionToken};

/// Default per-request timeout; a request exceeding it surfaces as a
/// transient error and is retried by the caller.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`HostedContentStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostedContentConfig {
    /// Base URL of the contents API, up to but excluding the blob path
    /// (e.g. `https://api.example.com/repos/acme/mirror/contents`).
    pub api_base: String,
    /// Bearer token sent with every request.
    pub auth_token: String,
    /// User-Agent header (the API rejects anonymous agents).
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl HostedContentConfig {
    pub fn new(api_base: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            auth_token: auth_token.into(),
            user_agent: "guildsync".into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// The API's GET response envelope.
#[derive(Deserialize)]
struct ContentEnvelope {
    sha: String,
    #[serde(default)]
    content: String,
}

/// The API's PUT request body.
#[derive(Serialize)]
struct PutBody<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

/// The API's PUT response envelope.
#[derive(Deserialize)]
struct PutResponse {
    content: PutResponseContent,
}

#[derive(Deserialize)]
struct PutResponseContent {
    sha: String,
}

/// Remote blob store backed by a hosted content API.
pub struct HostedContentStore {
    config: HostedContentConfig,
    client: reqwest::Client,
}

impl HostedContentStore {
    pub fn new(config: HostedContentConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Authorization", format!("Bearer {}", self.config.auth_token))
            .header("User-Agent", &self.config.user_agent)
            .header("Accept", "application/vnd.github.v3+json")
    }

    fn decode_body(path: &str, envelope: &ContentEnvelope) -> RemoteResult<Value> {
        // The API wraps base64 at 60 columns; strip the line breaks first.
        let compact: String = envelope
            .content
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        if compact.is_empty() {
            // Zero-byte blob: treat as an empty JSON object.
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let raw = BASE64.decode(compact).map_err(|e| RemoteError::Malformed {
            path: path.to_string(),
            reason: format!("invalid base64: {e}"),
        })?;
        serde_json::from_slice(&raw).map_err(|e| RemoteError::Malformed {
            path: path.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }

    fn status_error(path: &str, status: StatusCode, body: String) -> RemoteError {
        // 422 is how the API reports a sha mismatch on PUT; treat it as a
        // conflict alongside the documented 409.
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            RemoteError::Conflict {
                path: path.to_string(),
            }
        } else {
            RemoteError::Transient {
                path: path.to_string(),
                status: Some(status.as_u16()),
                message: body,
            }
        }
    }
}

#[async_trait]
impl RemoteBlobStore for HostedContentStore {
    async fn get(&self, path: &str) -> RemoteResult<Option<FetchedBlob>> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(path, status, body));
        }

        let envelope: ContentEnvelope =
            response.json().await.map_err(|e| RemoteError::Malformed {
                path: path.to_string(),
                reason: format!("invalid envelope: {e}"),
            })?;
        let value = Self::decode_body(path, &envelope)?;
        debug!(path, sha = %envelope.sha, "fetched remote blob");
        Ok(Some(FetchedBlob {
            value,
            version: VersionToken::new(envelope.sha),
        }))
    }

    async fn put(
        &self,
        path: &str,
        body: &Value,
        expected: Option<&VersionToken>,
    ) -> RemoteResult<VersionToken> {
        let encoded = serde_json::to_vec_pretty(body).map_err(|e| RemoteError::Malformed {
            path: path.to_string(),
            reason: format!("unserializable body: {e}"),
        })?;
        let put_body = PutBody {
            message: format!("Update {path}"),
            content: BASE64.encode(encoded),
            sha: expected.map(VersionToken::as_str),
        };

        let response = self
            .request(reqwest::Method::PUT, path)
            .json(&put_body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(path, status, body));
        }

        let parsed: PutResponse = response.json().await.map_err(|e| RemoteError::Malformed {
            path: path.to_string(),
            reason: format!("invalid put response: {e}"),
        })?;
        debug!(path, sha = %parsed.content.sha, "committed remote blob");
        Ok(VersionToken::new(parsed.content.sha))
    }
}
