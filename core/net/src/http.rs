//! HTTP client for the remote storage API.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use camsync_common::{Error, Result};

use crate::upload::{UploadClient, UploadOutcome, UploadRequest};

/// Largest response body excerpt kept in a failure reason.
const MAX_REASON_BODY: usize = 200;

/// Connection settings for the remote storage API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Upload endpoint, e.g. `https://api.example.com/images`.
    pub endpoint: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl UploadConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the endpoint parses and the timeout is non-zero.
    pub fn validate(&self) -> Result<Url> {
        if self.timeout_secs == 0 {
            return Err(Error::Config("upload timeout must be non-zero".to_string()));
        }
        Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid upload endpoint {:?}: {}", self.endpoint, e)))
    }
}

/// Successful response body from the storage API.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(alias = "url", alias = "key")]
    location: Option<String>,
}

/// Upload client that POSTs raw image bytes to the storage API.
///
/// Image metadata travels as query parameters; the body is the payload as-is.
pub struct HttpUploadClient {
    http: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpUploadClient {
    /// Create a new client.
    ///
    /// # Errors
    /// - `Config` if the endpoint is invalid
    /// - `Network` if the HTTP client cannot be built
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let endpoint = config.validate()?;
        let http = Client::builder()
            .user_agent(concat!("camsync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    /// Map a completed HTTP exchange onto an outcome.
    async fn handle_response(&self, response: reqwest::Response) -> UploadOutcome {
        let status = response.status();

        if status.is_success() {
            let location = match response.json::<UploadResponse>().await {
                Ok(body) => body.location,
                Err(e) => {
                    // The remote already accepted the bytes.
                    debug!("Upload accepted without a readable location: {}", e);
                    None
                }
            };
            return UploadOutcome::Delivered { location };
        }

        let body = response.text().await.unwrap_or_default();
        outcome_for_status(status, &body)
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, request: &UploadRequest) -> UploadOutcome {
        let captured_at = request.captured_at.to_rfc3339();
        let image_id = request.image_id.to_string();

        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, request.content_type.as_str())
            .query(&[
                ("camera_id", request.camera_id.as_str()),
                ("image_id", image_id.as_str()),
                ("captured_at", captured_at.as_str()),
            ])
            .body(request.payload.clone());

        if let Some(key) = &self.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        match builder.send().await {
            Ok(response) => self.handle_response(response).await,
            Err(e) => outcome_for_error(&e),
        }
    }
}

/// Classify a non-success HTTP status.
pub fn outcome_for_status(status: StatusCode, body: &str) -> UploadOutcome {
    let mut excerpt: String = body.chars().take(MAX_REASON_BODY).collect();
    if excerpt.is_empty() {
        excerpt = status.canonical_reason().unwrap_or("no body").to_string();
    }
    let reason = format!("API error: {} - {}", status, excerpt);

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        UploadOutcome::RetryableFailure(reason)
    } else {
        UploadOutcome::PermanentFailure(reason)
    }
}

/// Classify a transport error. Only a request that could not even be built
/// is permanent; everything else may succeed on another attempt.
fn outcome_for_error(err: &reqwest::Error) -> UploadOutcome {
    if err.is_builder() {
        UploadOutcome::PermanentFailure(format!("Invalid upload request: {}", err))
    } else if err.is_timeout() {
        UploadOutcome::RetryableFailure(format!("Upload timed out: {}", err))
    } else {
        UploadOutcome::RetryableFailure(format!("Upload failed: {}", err))
    }
}
