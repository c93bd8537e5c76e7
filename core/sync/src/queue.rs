//! Bounded, disk-backed FIFO of images waiting for upload.
//!
//! Each queued image is two files in `queue/`: `<id>.img` holds the payload
//! and `<id>.json` holds the metadata, including an insertion sequence
//! number that defines FIFO order. One unreadable metadata file only costs
//! that one record.
//!
//! An open store holds an exclusive lock on `queue.lock` in its base
//! directory until it is dropped, so only one process works on a queue.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, error, info, warn};

use camsync_common::{CameraId, Error, ImageId, Result};

use crate::state::{ImageRecord, Payload, RecordStatus};

const QUEUE_DIR: &str = "queue";
const QUARANTINE_DIR: &str = "quarantine";
const ARCHIVE_DIR: &str = "evicted";
const META_EXT: &str = "json";
const PAYLOAD_EXT: &str = "img";
const TMP_EXT: &str = "tmp";
const LOCK_FILE: &str = "queue.lock";

/// Default number of queued images.
pub const DEFAULT_CAPACITY: usize = 50;

/// Persisted metadata for one queued image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    seq: u64,
    id: ImageId,
    camera_id: CameraId,
    captured_at: DateTime<Utc>,
    attempt_count: u32,
    status: RecordStatus,
    payload_file: String,
    size: u64,
}

/// Result of appending to the queue.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// Appended without displacing anything.
    Appended,
    /// Appended after dropping this record, which will never be uploaded.
    Evicted(ImageRecord),
}

/// What happened while rebuilding the index from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Records back in the queue.
    pub recovered: usize,
    /// Records found mid-upload and reset to pending.
    pub reset_uploading: usize,
    /// Unreadable entries moved to quarantine.
    pub quarantined: usize,
    /// Payload or temp files with no metadata, deleted.
    pub orphans_removed: usize,
    /// Records dropped because the queue held more than its capacity.
    pub evicted: Vec<ImageId>,
}

/// Summary for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub count: usize,
    pub capacity: usize,
    pub total_size_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub storage_dir: PathBuf,
}

/// Bounded local queue store.
///
/// Not internally synchronized; the owner wraps it in a single lock so that
/// enqueue, peek and remove are mutually exclusive.
pub struct QueueStore {
    queue_dir: PathBuf,
    quarantine_dir: PathBuf,
    archive_dir: PathBuf,
    /// Ordered oldest first.
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    next_seq: u64,
    recovery: RecoveryReport,
    /// Exclusive lock on the base directory, released on drop.
    _lock: File,
}

/// Take the queue lock without blocking.
fn acquire_lock(lock_path: &Path) -> Result<File> {
    use fs2::FileExt;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    file.try_lock_exclusive().map_err(|e| {
        Error::Locked(format!(
            "{} is held by another process: {}",
            lock_path.display(),
            e
        ))
    })?;

    Ok(file)
}

impl QueueStore {
    /// Open the store under `base_dir`, rebuilding the index from disk.
    ///
    /// # Preconditions
    /// - `capacity` is at least 2, so a full queue always holds a record
    ///   that is not mid-upload
    ///
    /// # Errors
    /// - `InvalidInput` for a capacity below 2
    /// - `Locked` if another store already has `base_dir` open
    /// - `Io` if the directories cannot be created or listed
    pub async fn open(base_dir: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::InvalidInput(format!(
                "Queue capacity must be at least 2, got {}",
                capacity
            )));
        }

        let base_dir = base_dir.as_ref();
        let queue_dir = base_dir.join(QUEUE_DIR);
        let quarantine_dir = base_dir.join(QUARANTINE_DIR);
        let archive_dir = base_dir.join(ARCHIVE_DIR);

        fs::create_dir_all(base_dir).await?;
        let lock = acquire_lock(&base_dir.join(LOCK_FILE))?;

        fs::create_dir_all(&queue_dir).await?;
        fs::create_dir_all(&quarantine_dir).await?;
        fs::create_dir_all(&archive_dir).await?;

        let mut store = Self {
            queue_dir,
            quarantine_dir,
            archive_dir,
            entries: VecDeque::new(),
            capacity,
            next_seq: 0,
            recovery: RecoveryReport::default(),
            _lock: lock,
        };
        store.recover().await?;
        Ok(store)
    }

    /// Rebuild the in-memory index from the metadata files.
    async fn recover(&mut self) -> Result<()> {
        let mut report = RecoveryReport::default();
        let mut recovered = Vec::new();
        let mut payload_files = Vec::new();

        let mut dir = fs::read_dir(&self.queue_dir).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let path = dir_entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXT) => match self.load_entry(&path).await {
                    Ok(entry) => recovered.push(entry),
                    Err(e) => {
                        error!("Quarantining unreadable queue entry {}: {}", path.display(), e);
                        self.quarantine_files(&path).await;
                        report.quarantined += 1;
                    }
                },
                Some(PAYLOAD_EXT) => payload_files.push(path),
                Some(TMP_EXT) => {
                    fs::remove_file(&path).await?;
                    report.orphans_removed += 1;
                }
                _ => debug!("Ignoring unexpected file in queue: {}", path.display()),
            }
        }

        let known: HashSet<PathBuf> = recovered
            .iter()
            .map(|e| self.queue_dir.join(&e.payload_file))
            .collect();
        for path in payload_files {
            if !known.contains(&path) && fs::try_exists(&path).await.unwrap_or(false) {
                warn!("Removing orphaned payload {}", path.display());
                fs::remove_file(&path).await?;
                report.orphans_removed += 1;
            }
        }

        recovered.sort_by_key(|e| e.seq);
        for mut entry in recovered {
            if entry.status == RecordStatus::Uploading {
                // Nothing survives a restart in flight.
                entry.status = RecordStatus::Pending;
                self.persist_entry(&entry).await?;
                report.reset_uploading += 1;
            }
            self.next_seq = self.next_seq.max(entry.seq + 1);
            self.entries.push_back(entry);
        }

        while self.entries.len() > self.capacity {
            let Some(evicted) = self.evict_oldest().await? else {
                break;
            };
            warn!(
                "Queue over capacity after restart; evicted image {} ({})",
                evicted.id, evicted.camera_id
            );
            report.evicted.push(evicted.id);
        }

        report.recovered = self.entries.len();
        if report != RecoveryReport::default() {
            info!(
                "Queue recovered: {} pending, {} reset from uploading, {} quarantined, {} orphans removed",
                report.recovered, report.reset_uploading, report.quarantined, report.orphans_removed
            );
        }
        self.recovery = report;
        Ok(())
    }

    /// Read and validate one metadata file.
    async fn load_entry(&self, path: &Path) -> Result<QueueEntry> {
        let content = fs::read(path).await?;
        let entry: QueueEntry = serde_json::from_slice(&content)
            .map_err(|e| Error::StoreCorruption(format!("{}: {}", path.display(), e)))?;

        let expected_stem = entry.id.to_string();
        if path.file_stem().and_then(|s| s.to_str()) != Some(expected_stem.as_str()) {
            return Err(Error::StoreCorruption(format!(
                "{} does not match image id {}",
                path.display(),
                entry.id
            )));
        }

        let payload = self.queue_dir.join(&entry.payload_file);
        if !fs::try_exists(&payload).await.unwrap_or(false) {
            return Err(Error::StoreCorruption(format!(
                "payload {} missing for image {}",
                payload.display(),
                entry.id
            )));
        }
        Ok(entry)
    }

    /// Move a metadata file and its sibling payload into quarantine.
    async fn quarantine_files(&self, meta_path: &Path) {
        let payload_path = meta_path.with_extension(PAYLOAD_EXT);
        for path in [meta_path, payload_path.as_path()] {
            if let Some(name) = path.file_name() {
                if fs::try_exists(path).await.unwrap_or(false) {
                    if let Err(e) = fs::rename(path, self.quarantine_dir.join(name)).await {
                        error!("Failed to quarantine {}: {}", path.display(), e);
                        let _ = fs::remove_file(path).await;
                    }
                }
            }
        }
    }

    fn meta_path(&self, id: &ImageId) -> PathBuf {
        self.queue_dir.join(format!("{}.{}", id, META_EXT))
    }

    fn payload_path(&self, entry: &QueueEntry) -> PathBuf {
        self.queue_dir.join(&entry.payload_file)
    }

    /// Write metadata via a temp file and rename so readers never see a
    /// partial file.
    async fn persist_entry(&self, entry: &QueueEntry) -> Result<()> {
        let path = self.meta_path(&entry.id);
        let tmp = path.with_extension(TMP_EXT);
        let json = serde_json::to_vec_pretty(entry)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn to_record(&self, entry: &QueueEntry) -> ImageRecord {
        ImageRecord {
            id: entry.id,
            camera_id: entry.camera_id,
            captured_at: entry.captured_at,
            attempt_count: entry.attempt_count,
            status: entry.status,
            payload: Payload::Stored(self.payload_path(entry)),
            size: entry.size,
        }
    }

    fn position(&self, id: &ImageId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    /// Append a record, evicting the oldest idle record first if full.
    ///
    /// The record must still hold its payload in memory.
    ///
    /// # Postconditions
    /// - `count() <= capacity()`
    /// - The record is persisted as `pending`
    ///
    /// # Errors
    /// - `InvalidInput` if the payload is not inline or the id is queued
    /// - `Io` if the record cannot be written
    pub async fn enqueue(&mut self, record: ImageRecord) -> Result<EnqueueOutcome> {
        let payload = record.inline_payload().cloned().ok_or_else(|| {
            Error::InvalidInput(format!("Image {} has no in-memory payload", record.id))
        })?;
        if self.position(&record.id).is_some() {
            return Err(Error::InvalidInput(format!(
                "Image {} is already queued",
                record.id
            )));
        }

        let outcome = if self.entries.len() >= self.capacity {
            match self.evict_oldest().await? {
                Some(evicted) => EnqueueOutcome::Evicted(evicted),
                None => {
                    return Err(Error::InvalidInput(
                        "Queue is full and every record is mid-upload".to_string(),
                    ))
                }
            }
        } else {
            EnqueueOutcome::Appended
        };

        let entry = QueueEntry {
            seq: self.next_seq,
            id: record.id,
            camera_id: record.camera_id,
            captured_at: record.captured_at,
            attempt_count: record.attempt_count,
            status: RecordStatus::Pending,
            payload_file: format!("{}.{}", record.id, PAYLOAD_EXT),
            size: payload.len() as u64,
        };

        let payload_path = self.payload_path(&entry);
        fs::write(&payload_path, &payload).await?;
        if let Err(e) = self.persist_entry(&entry).await {
            let _ = fs::remove_file(&payload_path).await;
            return Err(e);
        }

        self.next_seq += 1;
        debug!("Queued image {} ({}) as #{}", entry.id, entry.camera_id, entry.seq);
        self.entries.push_back(entry);
        Ok(outcome)
    }

    /// Drop the oldest record that is not mid-upload. Its payload is moved to
    /// the eviction archive, or deleted if that fails.
    async fn evict_oldest(&mut self) -> Result<Option<ImageRecord>> {
        let Some(index) = self
            .entries
            .iter()
            .position(|e| e.status != RecordStatus::Uploading)
        else {
            return Ok(None);
        };

        let entry = self.entries[index].clone();
        fs::remove_file(self.meta_path(&entry.id)).await?;
        let record = self.to_record(&entry);
        self.entries.remove(index);

        let payload_path = self.payload_path(&entry);
        let archived = self.archive_dir.join(&entry.payload_file);
        if let Err(e) = fs::rename(&payload_path, &archived).await {
            warn!("Failed to archive evicted payload {}: {}", payload_path.display(), e);
            if let Err(e) = fs::remove_file(&payload_path).await {
                error!("Failed to delete evicted payload {}: {}", payload_path.display(), e);
            }
        }

        Ok(Some(ImageRecord {
            payload: Payload::Stored(archived),
            ..record
        }))
    }

    /// The earliest queued record, without removing it.
    pub fn peek_oldest(&self) -> Option<ImageRecord> {
        self.entries.front().map(|e| self.to_record(e))
    }

    /// Get a queued record by id.
    pub fn get(&self, id: &ImageId) -> Option<ImageRecord> {
        self.position(id).map(|i| self.to_record(&self.entries[i]))
    }

    /// Delete a record and its payload. Returns `None` if it is not queued.
    ///
    /// The metadata goes first: once it is gone the record cannot come back
    /// after a restart, even if the payload delete fails.
    pub async fn remove(&mut self, id: &ImageId) -> Result<Option<ImageRecord>> {
        let Some(index) = self.position(id) else {
            return Ok(None);
        };

        let entry = self.entries[index].clone();
        fs::remove_file(self.meta_path(id)).await?;
        self.entries.remove(index);

        let payload_path = self.payload_path(&entry);
        if let Err(e) = fs::remove_file(&payload_path).await {
            warn!("Failed to delete payload {}: {}", payload_path.display(), e);
        }
        Ok(Some(self.to_record(&entry)))
    }

    /// Move a record's files to quarantine and drop it from the queue.
    pub async fn quarantine(&mut self, id: &ImageId) -> Result<Option<ImageRecord>> {
        let Some(index) = self.position(id) else {
            return Ok(None);
        };
        let entry = self.entries.remove(index).ok_or_else(|| {
            Error::NotFound(format!("Queued image not found: {}", id))
        })?;
        self.quarantine_files(&self.meta_path(id)).await;
        Ok(Some(self.to_record(&entry)))
    }

    /// Mark a record as mid-upload. While uploading it is never evicted.
    pub async fn mark_uploading(&mut self, id: &ImageId) -> Result<ImageRecord> {
        self.update_status(id, |entry| {
            entry.status = RecordStatus::Uploading;
        })
        .await
    }

    /// Record a retryable failure: the record goes back to pending with one
    /// more attempt counted. Returns the new attempt count.
    pub async fn record_failure(&mut self, id: &ImageId) -> Result<u32> {
        let record = self
            .update_status(id, |entry| {
                entry.status = RecordStatus::Pending;
                entry.attempt_count += 1;
            })
            .await?;
        Ok(record.attempt_count)
    }

    async fn update_status<F>(&mut self, id: &ImageId, update: F) -> Result<ImageRecord>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let index = self
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("Queued image not found: {}", id)))?;

        let mut entry = self.entries[index].clone();
        update(&mut entry);
        self.persist_entry(&entry).await?;
        self.entries[index] = entry;
        Ok(self.to_record(&self.entries[index]))
    }

    /// Load the payload bytes of a queued record.
    pub async fn read_payload(&self, id: &ImageId) -> Result<Bytes> {
        let index = self
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("Queued image not found: {}", id)))?;
        let path = self.payload_path(&self.entries[index]);
        let data = fs::read(&path)
            .await
            .map_err(|e| Error::StoreCorruption(format!("{}: {}", path.display(), e)))?;
        Ok(Bytes::from(data))
    }

    /// Every queued record, oldest first.
    pub fn list_all(&self) -> Vec<ImageRecord> {
        self.entries.iter().map(|e| self.to_record(e)).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get total size of queued payloads.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// What the last open found on disk.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            count: self.count(),
            capacity: self.capacity,
            total_size_bytes: self.total_size(),
            oldest: self.entries.front().map(|e| e.captured_at),
            newest: self.entries.back().map(|e| e.captured_at),
            storage_dir: self.queue_dir.clone(),
        }
    }

    /// Delete archived evicted payloads last modified more than `max_age` ago.
    pub async fn prune_archive(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut pruned = 0;
        let mut dir = fs::read_dir(&self.archive_dir).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let path = dir_entry.path();
            let metadata = dir_entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            if metadata.modified()? <= cutoff {
                fs::remove_file(&path).await?;
                info!("Pruned archived image {}", path.display());
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}
