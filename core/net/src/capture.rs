//! Camera capture source.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use camsync_common::{CameraId, Error, Result};

/// The capture collaborator could not produce an image.
///
/// Terminal for the trigger that requested it; such captures are never queued.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No endpoint is configured for this camera.
    #[error("camera {0} is not configured")]
    NotConfigured(CameraId),

    /// The camera could not be reached or refused the request.
    #[error("camera {camera} capture failed: {reason}")]
    Failed { camera: CameraId, reason: String },

    /// The camera answered with no image data.
    #[error("camera {0} returned an empty image")]
    Empty(CameraId),
}

/// Produces image bytes for a camera on demand.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self, camera: CameraId) -> std::result::Result<Bytes, CaptureError>;
}

/// Snapshot endpoint for one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEndpoint {
    pub camera: CameraId,
    /// HTTP URL returning a single JPEG frame.
    pub snapshot_url: String,
}

/// Capture source that fetches one still image per call from each camera's
/// HTTP snapshot endpoint.
pub struct HttpSnapshotSource {
    http: Client,
    endpoints: HashMap<CameraId, Url>,
}

impl HttpSnapshotSource {
    /// Create a source for the given cameras.
    ///
    /// # Errors
    /// - `Config` if any snapshot URL is invalid
    pub fn new(cameras: &[CameraEndpoint], timeout: Duration) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for endpoint in cameras {
            let url = Url::parse(&endpoint.snapshot_url).map_err(|e| {
                Error::Config(format!(
                    "invalid snapshot url for {}: {}",
                    endpoint.camera, e
                ))
            })?;
            endpoints.insert(endpoint.camera, url);
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, endpoints })
    }

    /// Cameras this source can capture from.
    pub fn cameras(&self) -> Vec<CameraId> {
        let mut cameras: Vec<_> = self.endpoints.keys().copied().collect();
        cameras.sort();
        cameras
    }
}

#[async_trait]
impl CaptureSource for HttpSnapshotSource {
    async fn capture(&self, camera: CameraId) -> std::result::Result<Bytes, CaptureError> {
        let url = self
            .endpoints
            .get(&camera)
            .ok_or(CaptureError::NotConfigured(camera))?;

        let failed = |reason: String| CaptureError::Failed { camera, reason };

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("snapshot endpoint answered {}", status)));
        }

        let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        if body.is_empty() {
            return Err(CaptureError::Empty(camera));
        }
        Ok(body)
    }
}
