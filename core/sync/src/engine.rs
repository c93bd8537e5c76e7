//! Core sync engine that decides, per captured image, between direct upload
//! and the local queue, and drains the queue when connectivity returns.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use camsync_common::{CameraId, ConnectivityState, Error, ImageId, Result};
use camsync_net::{CaptureSource, ReachabilityProbe, UploadClient, UploadOutcome};

use crate::connectivity::{ConnectivityMonitor, MonitorConfig};
use crate::queue::{EnqueueOutcome, QueueInfo, QueueStore, DEFAULT_CAPACITY};
use crate::retry::{RetryConfig, RetryDecision, RetryPolicy};
use crate::scheduler::{DrainReport, DrainScheduler, DrainTrigger};
use crate::state::{ImageRecord, LossReason, SyncStats, SyncStatusReport};

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of queued images.
    pub max_queue_size: usize,
    /// Periodic drain sweep while online; `None` drains only on reconnect
    /// and on request.
    pub drain_interval: Option<Duration>,
    /// Retry budget and delay schedule.
    pub retry: RetryConfig,
    /// Connectivity probing.
    pub monitor: MonitorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_CAPACITY,
            drain_interval: Some(Duration::from_secs(60)),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Final state of one capture trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Uploaded on the direct path.
    Delivered {
        id: ImageId,
        camera: CameraId,
        location: Option<String>,
    },
    /// Stored in the local queue for a later drain.
    Queued {
        id: ImageId,
        camera: CameraId,
        /// A record dropped to make room.
        evicted: Option<ImageId>,
    },
    /// Rejected by the remote; never queued.
    Lost {
        id: ImageId,
        camera: CameraId,
        reason: String,
    },
    /// The camera produced no image.
    CaptureFailed { camera: CameraId, reason: String },
}

/// Main sync engine.
///
/// Owns the queue behind a single lock shared by the direct-path fallback
/// and the drain loop. At most one drain runs at a time.
pub struct SyncEngine {
    uploader: Arc<dyn UploadClient>,
    capture: Arc<dyn CaptureSource>,
    queue: Arc<Mutex<QueueStore>>,
    monitor: Arc<ConnectivityMonitor>,
    retry: RetryPolicy,
    /// Held for the duration of a drain pass.
    drain_guard: Mutex<()>,
    stats: SyncStats,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create a new sync engine with its own connectivity monitor.
    ///
    /// The monitor starts offline; the first probe decides.
    pub async fn new(
        data_dir: impl AsRef<Path>,
        uploader: Arc<dyn UploadClient>,
        capture: Arc<dyn CaptureSource>,
        probe: Arc<dyn ReachabilityProbe>,
        config: SyncConfig,
    ) -> Result<Self> {
        let monitor = Arc::new(ConnectivityMonitor::new(
            probe,
            config.monitor.clone(),
            ConnectivityState::Offline,
        ));
        Self::with_monitor(data_dir, uploader, capture, monitor, config).await
    }

    /// Create a sync engine around an existing connectivity monitor.
    pub async fn with_monitor(
        data_dir: impl AsRef<Path>,
        uploader: Arc<dyn UploadClient>,
        capture: Arc<dyn CaptureSource>,
        monitor: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue = QueueStore::open(data_dir, config.max_queue_size).await?;
        let stats = SyncStats::new();

        let recovery = queue.recovery_report();
        for id in &recovery.evicted {
            warn!("Image {} lost: {} (at startup)", id, LossReason::Evicted);
            stats.record_loss(&LossReason::Evicted);
        }
        for _ in 0..recovery.quarantined {
            stats.record_loss(&LossReason::Corrupted("unreadable at startup".to_string()));
        }

        info!(
            "Sync engine ready: {} queued, capacity {}, uploading via {}",
            queue.count(),
            queue.capacity(),
            uploader.name()
        );

        Ok(Self {
            uploader,
            capture,
            queue: Arc::new(Mutex::new(queue)),
            monitor,
            retry: RetryPolicy::new(config.retry.clone()),
            drain_guard: Mutex::new(()),
            stats,
            config,
        })
    }

    /// Get the connectivity monitor.
    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Capture an image from `camera` and route it.
    ///
    /// A capture failure is terminal for this trigger and nothing is queued.
    ///
    /// # Errors
    /// - `Io` if the image had to be queued and could not be written
    pub async fn handle_capture(&self, camera: CameraId) -> Result<CaptureOutcome> {
        match self.capture.capture(camera).await {
            Ok(image) => {
                self.stats.record_capture();
                let record = ImageRecord::new(camera, image);
                debug!("Captured image {} from {} ({} bytes)", record.id, camera, record.size);
                self.submit(record).await
            }
            Err(e) => {
                self.stats.record_capture_failure();
                warn!("Capture from {} failed: {}", camera, e);
                Ok(CaptureOutcome::CaptureFailed {
                    camera,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Run [`handle_capture`](Self::handle_capture) as an independent task.
    pub fn spawn_capture(self: &Arc<Self>, camera: CameraId) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.handle_capture(camera).await {
                Ok(outcome) => debug!("Trigger for {} finished: {:?}", camera, outcome),
                Err(e) => error!("Trigger for {} failed: {}", camera, e),
            }
        })
    }

    /// Route a freshly captured record: direct upload while online, the
    /// queue otherwise.
    pub async fn submit(&self, mut record: ImageRecord) -> Result<CaptureOutcome> {
        if !self.monitor.is_online() {
            debug!("Offline; queueing image {} without an attempt", record.id);
            return self.enqueue(record).await;
        }

        let payload = record.inline_payload().cloned().ok_or_else(|| {
            Error::InvalidInput(format!("Image {} has no in-memory payload", record.id))
        })?;
        let request = record.upload_request(payload);

        loop {
            record.mark_uploading()?;
            match self.uploader.upload(&request).await {
                UploadOutcome::Delivered { location } => {
                    record.mark_delivered()?;
                    self.stats.record_delivered(false);
                    info!(
                        "Delivered image {} from {} to {}",
                        record.id,
                        record.camera_id,
                        location.as_deref().unwrap_or("remote")
                    );
                    return Ok(CaptureOutcome::Delivered {
                        id: record.id,
                        camera: record.camera_id,
                        location,
                    });
                }
                UploadOutcome::PermanentFailure(reason) => {
                    record.mark_failed_permanent()?;
                    self.report_loss(&record, &LossReason::Rejected(reason.clone()));
                    return Ok(CaptureOutcome::Lost {
                        id: record.id,
                        camera: record.camera_id,
                        reason,
                    });
                }
                UploadOutcome::RetryableFailure(reason) => {
                    let failures = record.mark_retry()?;
                    match self.retry.next_delay(failures) {
                        RetryDecision::GiveUp => {
                            warn!(
                                "Direct upload of image {} failed {} times ({}); queueing",
                                record.id, failures, reason
                            );
                            break;
                        }
                        RetryDecision::RetryAfter(delay) => {
                            debug!(
                                "Direct upload of image {} failed ({}), retrying in {:?}",
                                record.id, reason, delay
                            );
                            if !self.wait_while_online(delay).await {
                                info!("Went offline while retrying image {}; queueing", record.id);
                                break;
                            }
                        }
                    }
                }
            }
        }

        // The drain gets a fresh retry budget.
        record.attempt_count = 0;
        self.enqueue(record).await
    }

    async fn enqueue(&self, record: ImageRecord) -> Result<CaptureOutcome> {
        let (id, camera) = (record.id, record.camera_id);
        let outcome = {
            let mut queue = self.queue.lock().await;
            queue.enqueue(record).await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Image {} from {} lost: could not be queued: {}", id, camera, e);
                return Err(e);
            }
        };

        self.stats.record_queued();
        let evicted = match outcome {
            EnqueueOutcome::Appended => None,
            EnqueueOutcome::Evicted(dropped) => {
                self.report_loss(&dropped, &LossReason::Evicted);
                Some(dropped.id)
            }
        };
        info!("Queued image {} from {}", id, camera);

        Ok(CaptureOutcome::Queued {
            id,
            camera,
            evicted,
        })
    }

    fn report_loss(&self, record: &ImageRecord, reason: &LossReason) {
        self.stats.record_loss(reason);
        match reason {
            LossReason::Evicted => warn!(
                "Image {} from {} (captured {}) lost: {}",
                record.id, record.camera_id, record.captured_at, reason
            ),
            _ => error!(
                "Image {} from {} (captured {}) lost: {}",
                record.id, record.camera_id, record.captured_at, reason
            ),
        }
    }

    /// Upload queued records oldest first while online.
    ///
    /// Returns immediately with `already_running` if another pass holds the
    /// drain. A retryable failure retries the same record in place; going
    /// offline stops the pass before the next attempt and leaves every
    /// remaining record pending.
    pub async fn drain(&self, trigger: DrainTrigger) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            debug!("Drain ({:?}) skipped: already running", trigger);
            return Ok(DrainReport {
                already_running: true,
                remaining: self.queue_count().await,
                ..DrainReport::default()
            });
        };

        let start = Instant::now();
        let mut report = DrainReport::default();
        debug!("Starting drain ({:?})", trigger);

        loop {
            if !self.monitor.is_online() {
                report.interrupted = !self.queue.lock().await.is_empty();
                if report.interrupted {
                    info!("Drain stopped: connectivity lost");
                }
                break;
            }

            let (record, payload) = {
                let mut queue = self.queue.lock().await;
                let Some(oldest) = queue.peek_oldest() else {
                    break;
                };
                match queue.read_payload(&oldest.id).await {
                    Ok(payload) => (queue.mark_uploading(&oldest.id).await?, payload),
                    Err(e) => {
                        queue.quarantine(&oldest.id).await?;
                        drop(queue);
                        self.report_loss(&oldest, &LossReason::Corrupted(e.to_string()));
                        report.lost += 1;
                        continue;
                    }
                }
            };

            match self.uploader.upload(&record.upload_request(payload)).await {
                UploadOutcome::Delivered { location } => {
                    self.queue.lock().await.remove(&record.id).await?;
                    self.stats.record_delivered(true);
                    report.delivered += 1;
                    info!(
                        "Delivered queued image {} from {} to {}",
                        record.id,
                        record.camera_id,
                        location.as_deref().unwrap_or("remote")
                    );
                }
                UploadOutcome::PermanentFailure(reason) => {
                    self.queue.lock().await.remove(&record.id).await?;
                    self.report_loss(&record, &LossReason::Rejected(reason));
                    report.lost += 1;
                }
                UploadOutcome::RetryableFailure(reason) => {
                    let (failures, decision) = {
                        let mut queue = self.queue.lock().await;
                        let failures = queue.record_failure(&record.id).await?;
                        let decision = self.retry.next_delay(failures);
                        if decision == RetryDecision::GiveUp {
                            queue.remove(&record.id).await?;
                        }
                        (failures, decision)
                    };

                    match decision {
                        RetryDecision::GiveUp => {
                            self.report_loss(
                                &record,
                                &LossReason::RetriesExhausted(format!(
                                    "{} attempts, last: {}",
                                    failures, reason
                                )),
                            );
                            report.lost += 1;
                        }
                        RetryDecision::RetryAfter(delay) => {
                            debug!(
                                "Queued image {} failed ({}/{}): {}; retrying in {:?}",
                                record.id,
                                failures,
                                self.retry.config().max_retries,
                                reason,
                                delay
                            );
                            // The loop head stops the pass if this returns early.
                            self.wait_while_online(delay).await;
                        }
                    }
                }
            }
        }

        report.remaining = self.queue_count().await;
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Wait out a retry delay, cut short by a drop to offline.
    ///
    /// Returns whether the monitor still reports online.
    async fn wait_while_online(&self, delay: Duration) -> bool {
        let mut connectivity = self.monitor.subscribe();
        if !connectivity.borrow_and_update().is_online() {
            return false;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return self.monitor.is_online(),
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        sleep.as_mut().await;
                        return self.monitor.is_online();
                    }
                    if !connectivity.borrow_and_update().is_online() {
                        return false;
                    }
                }
            }
        }
    }

    /// Drain now, exactly as a reconnect would.
    pub async fn force_drain(&self) -> Result<DrainReport> {
        self.drain(DrainTrigger::Forced).await
    }

    /// Snapshot for the dashboard.
    pub async fn status(&self) -> SyncStatusReport {
        let draining = self.drain_guard.try_lock().is_err();
        let queue = self.queue.lock().await;
        SyncStatusReport {
            connectivity: self.monitor.current(),
            last_check: self.monitor.last_check(),
            pending: queue.count(),
            capacity: queue.capacity(),
            draining,
            stats: self.stats.snapshot(),
        }
    }

    pub async fn queue_count(&self) -> usize {
        self.queue.lock().await.count()
    }

    /// Queued records, oldest first.
    pub async fn list_queue(&self) -> Vec<ImageRecord> {
        self.queue.lock().await.list_all()
    }

    pub async fn queue_info(&self) -> QueueInfo {
        self.queue.lock().await.info()
    }

    /// Delete archived evicted images older than `max_age`.
    pub async fn prune_archive(&self, max_age: Duration) -> Result<usize> {
        self.queue.lock().await.prune_archive(max_age).await
    }

    /// Start the connectivity monitor and the drain scheduler.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (scheduler, handle) = DrainScheduler::new(self.config.drain_interval);

        let monitor_task = tokio::spawn(Arc::clone(&self.monitor).run(shutdown_rx));

        let engine = Arc::clone(self);
        let connectivity = self.monitor.subscribe();
        let drain_task = tokio::spawn(handle.run(connectivity, move |trigger| {
            let engine = Arc::clone(&engine);
            async move { engine.drain(trigger).await }
        }));

        BackgroundTasks {
            scheduler,
            shutdown_tx,
            monitor_task,
            drain_task,
        }
    }
}

/// Running background tasks of a [`SyncEngine`].
pub struct BackgroundTasks {
    scheduler: DrainScheduler,
    shutdown_tx: watch::Sender<bool>,
    monitor_task: JoinHandle<()>,
    drain_task: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Get the scheduler for requesting drains.
    pub fn scheduler(&self) -> &DrainScheduler {
        &self.scheduler
    }

    /// Stop probing and scheduling. A drain pass in progress finishes its
    /// current record first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.scheduler.shutdown().await;
        if let Err(e) = self.drain_task.await {
            error!("Drain scheduler task failed: {}", e);
        }
        if let Err(e) = self.monitor_task.await {
            error!("Connectivity monitor task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use camsync_net::{MemoryCaptureSource, MemoryUploadClient, StaticProbe, UploadRequest};
    use tempfile::TempDir;

    use crate::state::RecordStatus;

    fn fast_config() -> SyncConfig {
        SyncConfig {
            drain_interval: None,
            retry: RetryConfig::new(5).with_initial_delay(Duration::from_millis(1)),
            monitor: MonitorConfig::default()
                .with_offline_after_failures(1)
                .with_probe_interval(Duration::from_millis(10)),
            ..SyncConfig::default()
        }
    }

    fn monitor(state: ConnectivityState) -> Arc<ConnectivityMonitor> {
        Arc::new(ConnectivityMonitor::new(
            Arc::new(StaticProbe::new(state)),
            fast_config().monitor,
            state,
        ))
    }

    fn cameras() -> Arc<MemoryCaptureSource> {
        Arc::new(
            MemoryCaptureSource::new()
                .with_image(CameraId::Camera1, Bytes::from_static(b"jpeg-1"))
                .with_image(CameraId::Camera2, Bytes::from_static(b"jpeg-2")),
        )
    }

    async fn engine(
        temp: &TempDir,
        uploader: Arc<dyn UploadClient>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::with_monitor(temp.path(), uploader, cameras(), monitor, fast_config())
                .await
                .unwrap(),
        )
    }

    fn queued_id(outcome: &CaptureOutcome) -> ImageId {
        match outcome {
            CaptureOutcome::Queued { id, .. } => *id,
            other => panic!("expected queued, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_online_capture_never_touches_queue() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Online)).await;

        let outcome = engine.handle_capture(CameraId::Camera1).await.unwrap();
        let CaptureOutcome::Delivered { id, location, .. } = outcome else {
            panic!("expected delivery, got {:?}", outcome);
        };

        assert_eq!(uploader.delivered(), vec![id]);
        assert!(location.is_some());
        assert_eq!(engine.queue_count().await, 0);
        assert_eq!(engine.status().await.stats.queued, 0);
    }

    #[tokio::test]
    async fn test_direct_retry_then_delivered() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::with_script(vec![
            UploadOutcome::RetryableFailure("503".to_string()),
            UploadOutcome::RetryableFailure("timeout".to_string()),
        ]));
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Online)).await;

        let outcome = engine.handle_capture(CameraId::Camera2).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Delivered { .. }));
        assert_eq!(uploader.attempts(), 3);
        assert_eq!(engine.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_direct_retries_exhausted_falls_back_to_queue() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::with_script(
            (0..5)
                .map(|_| UploadOutcome::RetryableFailure("503".to_string()))
                .collect(),
        ));
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Online)).await;

        let outcome = engine.handle_capture(CameraId::Camera1).await.unwrap();
        let id = queued_id(&outcome);
        assert_eq!(uploader.attempts(), 5);

        let queued = engine.list_queue().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert_eq!(queued[0].attempt_count, 0);
        assert_eq!(queued[0].status, RecordStatus::Pending);

        // The drain then delivers it.
        let report = engine.force_drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(uploader.delivered(), vec![id]);
    }

    #[tokio::test]
    async fn test_offline_during_direct_retry_queues() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Online);
        let hook_monitor = monitor.clone();
        let uploader = Arc::new(
            MemoryUploadClient::with_script(vec![UploadOutcome::RetryableFailure(
                "connection reset".to_string(),
            )])
            .with_hook(move |_, _| {
                hook_monitor.observe(ConnectivityState::Offline);
            }),
        );
        let engine = engine(&temp, uploader.clone(), monitor).await;

        let outcome = engine.handle_capture(CameraId::Camera1).await.unwrap();
        queued_id(&outcome);
        assert_eq!(uploader.attempts(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_lost_not_queued() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::with_script(vec![
            UploadOutcome::PermanentFailure("HTTP 415".to_string()),
        ]));
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Online)).await;

        let outcome = engine.handle_capture(CameraId::Camera1).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Lost { .. }));
        assert_eq!(uploader.attempts(), 1);
        assert_eq!(engine.queue_count().await, 0);
        assert_eq!(engine.status().await.stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_capture_failure_not_queued() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = Arc::new(
            SyncEngine::with_monitor(
                temp.path(),
                uploader.clone(),
                Arc::new(MemoryCaptureSource::new()),
                monitor(ConnectivityState::Offline),
                fast_config(),
            )
            .await
            .unwrap(),
        );

        let outcome = engine.handle_capture(CameraId::Camera1).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::CaptureFailed { .. }));
        assert_eq!(engine.queue_count().await, 0);
        assert_eq!(uploader.attempts(), 0);
        assert_eq!(engine.status().await.stats.capture_failures, 1);
    }

    #[tokio::test]
    async fn test_offline_capture_delivered_exactly_once() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = engine(&temp, uploader.clone(), monitor.clone()).await;

        let id = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        assert_eq!(uploader.attempts(), 0);

        monitor.observe(ConnectivityState::Online);
        let report = engine.drain(DrainTrigger::Reconnected).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 0);

        // A second pass finds nothing to do.
        let report = engine.drain(DrainTrigger::Reconnected).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(uploader.delivered(), vec![id]);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let uploader = Arc::new(MemoryUploadClient::with_script(vec![
            UploadOutcome::RetryableFailure("503".to_string()),
        ]));
        let engine = engine(&temp, uploader.clone(), monitor.clone()).await;

        let mut ids = Vec::new();
        for camera in [CameraId::Camera1, CameraId::Camera2, CameraId::Camera1] {
            ids.push(queued_id(&engine.handle_capture(camera).await.unwrap()));
        }

        monitor.observe(ConnectivityState::Online);
        engine.force_drain().await.unwrap();
        assert_eq!(uploader.delivered(), ids);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = engine(&temp, uploader, monitor(ConnectivityState::Offline)).await;

        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap()));
        }

        let outcome = engine.handle_capture(CameraId::Camera2).await.unwrap();
        let CaptureOutcome::Queued { id: newest, evicted, .. } = outcome else {
            panic!("expected queued, got {:?}", outcome);
        };
        assert_eq!(evicted, Some(ids[0]));

        let queued: Vec<_> = engine.list_queue().await.into_iter().map(|r| r.id).collect();
        assert_eq!(queued.len(), 50);
        assert_eq!(queued[0], ids[1]);
        assert_eq!(queued[49], newest);
        assert_eq!(engine.status().await.stats.evicted, 1);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_max_retries() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let uploader = Arc::new(MemoryUploadClient::with_script(
            (0..5)
                .map(|_| UploadOutcome::RetryableFailure("502".to_string()))
                .collect(),
        ));
        let engine = engine(&temp, uploader.clone(), monitor.clone()).await;

        let doomed = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        let next = queued_id(&engine.handle_capture(CameraId::Camera2).await.unwrap());

        monitor.observe(ConnectivityState::Online);
        let report = engine.force_drain().await.unwrap();

        assert_eq!(report.lost, 1);
        assert_eq!(report.delivered, 1);
        // Five attempts on the first record, one on the second.
        assert_eq!(uploader.attempts(), 6);
        assert_eq!(uploader.delivered(), vec![next]);
        assert!(!engine.list_queue().await.iter().any(|r| r.id == doomed));
        assert_eq!(engine.status().await.stats.retries_exhausted, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_during_drain_moves_on() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let uploader = Arc::new(MemoryUploadClient::with_script(vec![
            UploadOutcome::PermanentFailure("HTTP 400".to_string()),
        ]));
        let engine = engine(&temp, uploader.clone(), monitor.clone()).await;

        queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        let second = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());

        monitor.observe(ConnectivityState::Online);
        let report = engine.force_drain().await.unwrap();
        assert_eq!(report.lost, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(uploader.delivered(), vec![second]);
    }

    #[tokio::test]
    async fn test_offline_mid_drain_resumes_in_order() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let hook_monitor = monitor.clone();
        let uploader = Arc::new(
            MemoryUploadClient::with_script(vec![
                UploadOutcome::Delivered { location: None },
                UploadOutcome::RetryableFailure("connection reset".to_string()),
            ])
            .with_hook(move |attempt, _| {
                if attempt == 2 {
                    hook_monitor.observe(ConnectivityState::Offline);
                }
            }),
        );
        let engine = engine(&temp, uploader.clone(), monitor.clone()).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap()));
        }

        monitor.observe(ConnectivityState::Online);
        let report = engine.drain(DrainTrigger::Reconnected).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(uploader.attempts(), 2);

        let pending = engine.list_queue().await;
        assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), ids[1..]);
        assert!(pending.iter().all(|r| r.status == RecordStatus::Pending));

        monitor.observe(ConnectivityState::Online);
        let report = engine.drain(DrainTrigger::Reconnected).await.unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.delivered, 2);
        assert_eq!(uploader.delivered(), ids);
    }

    #[tokio::test]
    async fn test_drain_while_offline_does_nothing() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Offline)).await;

        engine.handle_capture(CameraId::Camera1).await.unwrap();
        let report = engine.force_drain().await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.remaining, 1);
        assert_eq!(uploader.attempts(), 0);
    }

    #[tokio::test]
    async fn test_restart_recovers_pending_records() {
        let temp = TempDir::new().unwrap();
        let ids = {
            let uploader = Arc::new(MemoryUploadClient::new());
            let engine = engine(&temp, uploader, monitor(ConnectivityState::Offline)).await;
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(queued_id(&engine.handle_capture(CameraId::Camera2).await.unwrap()));
            }
            ids
        };

        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Online)).await;
        assert_eq!(engine.queue_count().await, 3);

        engine.force_drain().await.unwrap();
        assert_eq!(uploader.delivered(), ids);

        // Delivered records do not come back.
        drop(engine);
        let engine = self::engine(
            &temp,
            Arc::new(MemoryUploadClient::new()),
            monitor(ConnectivityState::Offline),
        )
        .await;
        assert_eq!(engine.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_quarantined_during_drain() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = engine(&temp, uploader.clone(), monitor.clone()).await;

        let broken = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        let fine = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        std::fs::remove_file(temp.path().join("queue").join(format!("{}.img", broken))).unwrap();

        monitor.observe(ConnectivityState::Online);
        let report = engine.force_drain().await.unwrap();
        assert_eq!(report.lost, 1);
        assert_eq!(uploader.delivered(), vec![fine]);
        assert_eq!(engine.status().await.stats.corrupted, 1);
    }

    struct SlowUploadClient;

    #[async_trait]
    impl UploadClient for SlowUploadClient {
        fn name(&self) -> &str {
            "slow"
        }

        async fn upload(&self, _request: &UploadRequest) -> UploadOutcome {
            tokio::time::sleep(Duration::from_millis(50)).await;
            UploadOutcome::Delivered { location: None }
        }
    }

    #[tokio::test]
    async fn test_only_one_drain_at_a_time() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let engine = engine(&temp, Arc::new(SlowUploadClient), monitor.clone()).await;

        engine.handle_capture(CameraId::Camera1).await.unwrap();
        engine.handle_capture(CameraId::Camera2).await.unwrap();
        monitor.observe(ConnectivityState::Online);

        let (first, second) = tokio::join!(
            engine.drain(DrainTrigger::Reconnected),
            engine.drain(DrainTrigger::Forced)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.already_running != second.already_running);
        assert_eq!(first.delivered + second.delivered, 2);
        assert_eq!(engine.queue_count().await, 0);
    }

    /// Holds every upload until two are in flight at once.
    struct RendezvousUploadClient {
        barrier: tokio::sync::Barrier,
        cameras: std::sync::Mutex<Vec<CameraId>>,
    }

    #[async_trait]
    impl UploadClient for RendezvousUploadClient {
        fn name(&self) -> &str {
            "rendezvous"
        }

        async fn upload(&self, request: &UploadRequest) -> UploadOutcome {
            self.barrier.wait().await;
            self.cameras.lock().unwrap().push(request.camera_id);
            UploadOutcome::Delivered { location: None }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_captures_from_both_cameras() {
        let temp = TempDir::new().unwrap();
        let uploader = Arc::new(RendezvousUploadClient {
            barrier: tokio::sync::Barrier::new(2),
            cameras: std::sync::Mutex::new(Vec::new()),
        });
        let engine = engine(&temp, uploader.clone(), monitor(ConnectivityState::Online)).await;

        // Neither upload can finish unless the other is in flight too.
        let first = engine.spawn_capture(CameraId::Camera1);
        let second = engine.spawn_capture(CameraId::Camera2);
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .unwrap();

        let mut cameras = uploader.cameras.lock().unwrap().clone();
        cameras.sort();
        assert_eq!(cameras, vec![CameraId::Camera1, CameraId::Camera2]);
        assert_eq!(engine.queue_count().await, 0);
        let stats = engine.status().await.stats;
        assert_eq!(stats.captures, 2);
        assert_eq!(stats.delivered_direct, 2);
    }

    #[tokio::test]
    async fn test_offline_cuts_drain_retry_delay_short() {
        let temp = TempDir::new().unwrap();
        let monitor = monitor(ConnectivityState::Offline);
        let uploader = Arc::new(MemoryUploadClient::with_script(vec![
            UploadOutcome::RetryableFailure("503".to_string()),
        ]));
        let config = SyncConfig {
            retry: RetryConfig::new(5).with_initial_delay(Duration::from_secs(60)),
            ..fast_config()
        };
        let engine = Arc::new(
            SyncEngine::with_monitor(temp.path(), uploader.clone(), cameras(), monitor.clone(), config)
                .await
                .unwrap(),
        );

        let id = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        monitor.observe(ConnectivityState::Online);

        let flip = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flip.observe(ConnectivityState::Offline);
        });

        let report = tokio::time::timeout(Duration::from_secs(5), engine.force_drain())
            .await
            .unwrap()
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.remaining, 1);
        assert_eq!(uploader.attempts(), 1);

        let pending = engine.list_queue().await;
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, RecordStatus::Pending);
        assert_eq!(pending[0].attempt_count, 1);
    }

    #[test]
    fn test_capture_outcome_json() {
        let outcome = CaptureOutcome::CaptureFailed {
            camera: CameraId::Camera2,
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "capture_failed");
        assert_eq!(json["camera"], "camera_2");
        let back: CaptureOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[tokio::test]
    async fn test_status_report() {
        let temp = TempDir::new().unwrap();
        let engine = engine(
            &temp,
            Arc::new(MemoryUploadClient::new()),
            monitor(ConnectivityState::Offline),
        )
        .await;

        engine.handle_capture(CameraId::Camera1).await.unwrap();
        let status = engine.status().await;
        assert_eq!(status.connectivity, ConnectivityState::Offline);
        assert_eq!(status.pending, 1);
        assert_eq!(status.capacity, 50);
        assert!(!status.draining);
        assert_eq!(status.stats.captures, 1);
        assert_eq!(status.stats.queued, 1);
    }

    #[tokio::test]
    async fn test_background_drains_on_reconnect() {
        let temp = TempDir::new().unwrap();
        let probe = Arc::new(StaticProbe::new(ConnectivityState::Offline));
        let uploader = Arc::new(MemoryUploadClient::new());
        let engine = Arc::new(
            SyncEngine::new(temp.path(), uploader.clone(), cameras(), probe.clone(), fast_config())
                .await
                .unwrap(),
        );

        let id = queued_id(&engine.handle_capture(CameraId::Camera1).await.unwrap());
        let tasks = engine.spawn_background();

        probe.set(ConnectivityState::Online);
        tokio::time::timeout(Duration::from_secs(5), async {
            while uploader.delivered().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(uploader.delivered(), vec![id]);
        tasks.shutdown().await;
    }
}
