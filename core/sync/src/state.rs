//! Image record state tracking and sync statistics.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use camsync_common::{CameraId, ConnectivityState, Error, ImageId, Result};
use camsync_net::UploadRequest;

/// Delivery status of a single image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Waiting for an upload attempt.
    Pending,
    /// An upload attempt is in flight.
    Uploading,
    /// The remote accepted the image.
    Delivered,
    /// The image will never be delivered.
    FailedPermanent,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Delivered | RecordStatus::FailedPermanent)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// pending -> uploading -> {delivered | pending | failed_permanent}.
    /// A pending record may also be abandoned directly when the queue gives up
    /// on it without an attempt.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, FailedPermanent)
                | (Uploading, Delivered)
                | (Uploading, Pending)
                | (Uploading, FailedPermanent)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Uploading => "uploading",
            RecordStatus::Delivered => "delivered",
            RecordStatus::FailedPermanent => "failed_permanent",
        };
        f.write_str(name)
    }
}

/// Where the image bytes live.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Held in memory by the orchestrator; not yet queued.
    Inline(Bytes),
    /// Persisted by the queue store at this path.
    Stored(PathBuf),
}

/// One captured image awaiting or having completed delivery.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Assigned at capture time; never reused.
    pub id: ImageId,
    pub camera_id: CameraId,
    pub captured_at: DateTime<Utc>,
    /// Failed attempts counted against the current retry budget.
    pub attempt_count: u32,
    pub status: RecordStatus,
    pub payload: Payload,
    /// Payload size in bytes.
    pub size: u64,
}

impl ImageRecord {
    /// Create a pending record for freshly captured bytes.
    pub fn new(camera_id: CameraId, payload: Bytes) -> Self {
        Self {
            id: ImageId::new(),
            camera_id,
            captured_at: Utc::now(),
            attempt_count: 0,
            status: RecordStatus::Pending,
            size: payload.len() as u64,
            payload: Payload::Inline(payload),
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: RecordStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "Image {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Mark as uploading.
    pub fn mark_uploading(&mut self) -> Result<()> {
        self.transition(RecordStatus::Uploading)
    }

    /// Mark as delivered.
    pub fn mark_delivered(&mut self) -> Result<()> {
        self.transition(RecordStatus::Delivered)
    }

    /// Record a retryable failure: back to pending with one more attempt
    /// counted. Returns the new attempt count.
    pub fn mark_retry(&mut self) -> Result<u32> {
        self.transition(RecordStatus::Pending)?;
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }

    /// Mark as permanently failed.
    pub fn mark_failed_permanent(&mut self) -> Result<()> {
        self.transition(RecordStatus::FailedPermanent)
    }

    /// In-memory payload bytes, if the record has not been queued.
    pub fn inline_payload(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Inline(bytes) => Some(bytes),
            Payload::Stored(_) => None,
        }
    }

    /// Build the upload request for this record.
    pub fn upload_request(&self, payload: Bytes) -> UploadRequest {
        UploadRequest::new(self.id, self.camera_id, self.captured_at, payload)
    }
}

/// Why an image was lost without delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// Dropped to make room in the full queue.
    Evicted,
    /// The remote rejected the content.
    Rejected(String),
    /// Every allowed attempt failed.
    RetriesExhausted(String),
    /// The queued copy could not be read back.
    Corrupted(String),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Evicted => f.write_str("evicted from full queue"),
            LossReason::Rejected(reason) => write!(f, "rejected by remote: {}", reason),
            LossReason::RetriesExhausted(reason) => write!(f, "retries exhausted: {}", reason),
            LossReason::Corrupted(reason) => write!(f, "queued copy unreadable: {}", reason),
        }
    }
}

/// Running counters for the status dashboard.
#[derive(Debug, Default)]
pub struct SyncStats {
    captures: AtomicU64,
    capture_failures: AtomicU64,
    delivered_direct: AtomicU64,
    delivered_from_queue: AtomicU64,
    queued: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    retries_exhausted: AtomicU64,
    corrupted: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_capture(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, from_queue: bool) {
        if from_queue {
            self.delivered_from_queue.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivered_direct.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loss(&self, reason: &LossReason) {
        let counter = match reason {
            LossReason::Evicted => &self.evicted,
            LossReason::Rejected(_) => &self.rejected,
            LossReason::RetriesExhausted(_) => &self.retries_exhausted,
            LossReason::Corrupted(_) => &self.corrupted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captures: self.captures.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            delivered_direct: self.delivered_direct.load(Ordering::Relaxed),
            delivered_from_queue: self.delivered_from_queue.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub captures: u64,
    pub capture_failures: u64,
    pub delivered_direct: u64,
    pub delivered_from_queue: u64,
    pub queued: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub retries_exhausted: u64,
    pub corrupted: u64,
}

impl StatsSnapshot {
    /// Images lost for any reason.
    pub fn total_lost(&self) -> u64 {
        self.evicted + self.rejected + self.retries_exhausted + self.corrupted
    }
}

/// Read-only view served to the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub connectivity: ConnectivityState,
    pub last_check: Option<DateTime<Utc>>,
    pub pending: usize,
    pub capacity: usize,
    pub draining: bool,
    pub stats: StatsSnapshot,
}
