//! Upload client trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use camsync_common::{CameraId, ImageId};

/// Default content type for camera snapshots.
pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// Everything the remote storage API needs for one image.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Capture-time identifier, used by the remote for de-duplication.
    pub image_id: ImageId,
    /// Camera that produced the image.
    pub camera_id: CameraId,
    /// When the image was captured.
    pub captured_at: DateTime<Utc>,
    /// MIME type of the payload.
    pub content_type: String,
    /// Raw image bytes.
    pub payload: Bytes,
}

impl UploadRequest {
    /// Create a request with the default JPEG content type.
    pub fn new(
        image_id: ImageId,
        camera_id: CameraId,
        captured_at: DateTime<Utc>,
        payload: Bytes,
    ) -> Self {
        Self {
            image_id,
            camera_id,
            captured_at,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            payload,
        }
    }
}

/// Result of a single upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The remote accepted the image.
    Delivered {
        /// Storage location reported by the remote, if it sent one.
        location: Option<String>,
    },
    /// Transient condition; the caller may try again later.
    RetryableFailure(String),
    /// The remote will never accept this content.
    PermanentFailure(String),
}

impl UploadOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, UploadOutcome::Delivered { .. })
    }
}

/// Upload client for the remote storage API.
///
/// Implementations perform exactly one network call per invocation and must
/// bound it with a timeout. Retry orchestration belongs to the caller.
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Get the client name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Attempt to upload one image.
    ///
    /// # Postconditions
    /// - `Delivered`: the remote holds the image
    /// - `RetryableFailure`: network error, timeout, 5xx, 408 or 429
    /// - `PermanentFailure`: any other rejection
    async fn upload(&self, request: &UploadRequest) -> UploadOutcome;
}
