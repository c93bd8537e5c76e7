//! Process configuration, loaded once at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use camsync_common::{CameraId, Error, Result, UnmappedTriggerPolicy};
use camsync_net::{CameraEndpoint, UploadConfig};
use camsync_sync::{MonitorConfig, RetryConfig, SyncConfig, DEFAULT_CAPACITY};

/// Application configuration.
///
/// Read from a JSON file; every field is optional and falls back to its
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the queue, quarantine and eviction archive.
    pub data_dir: PathBuf,
    /// Remote storage API.
    pub upload: UploadConfig,
    /// URL probed to decide connectivity.
    pub probe_url: String,
    /// Snapshot endpoint per camera.
    pub cameras: Vec<CameraEndpoint>,
    /// Address the trigger listener binds to.
    pub trigger_bind: String,
    /// Handling of trigger text that names no camera.
    pub unmapped_trigger: UnmappedTriggerPolicy,
    /// Maximum number of queued images.
    pub max_queue_size: usize,
    /// Upload attempts per image before giving up.
    pub max_retries: u32,
    /// Delay after the first failed attempt, in seconds.
    pub retry_delay_secs: u64,
    /// Cap on the retry delay, in seconds.
    pub max_retry_delay_secs: u64,
    /// 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failed probes before going offline.
    pub offline_after_failures: u32,
    /// Periodic drain while online; `null` disables it.
    pub drain_interval_secs: Option<u64>,
    pub capture_timeout_secs: u64,
    /// Age after which archived evicted images are pruned.
    pub archive_retention_days: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            upload: UploadConfig::new(""),
            probe_url: String::new(),
            cameras: Vec::new(),
            trigger_bind: "0.0.0.0:9090".to_string(),
            unmapped_trigger: UnmappedTriggerPolicy::default(),
            max_queue_size: DEFAULT_CAPACITY,
            max_retries: 5,
            retry_delay_secs: 5,
            max_retry_delay_secs: 60,
            backoff_multiplier: 1.0,
            jitter: false,
            probe_interval_secs: 10,
            probe_timeout_secs: 5,
            offline_after_failures: 2,
            drain_interval_secs: Some(60),
            capture_timeout_secs: 10,
            archive_retention_days: 30,
        }
    }
}

/// Platform data directory, or the working directory if there is none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camsync")
}

impl AppConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(content) => serde_json::from_slice(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check the settings the queue and retry logic depend on.
    pub fn validate_storage(&self) -> Result<()> {
        if self.max_queue_size < 2 {
            return Err(Error::Config(format!(
                "max_queue_size must be at least 2, got {}",
                self.max_queue_size
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be greater than 0".to_string()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Full check before talking to the network.
    pub fn validate(&self) -> Result<()> {
        self.validate_storage()?;
        if self.upload.endpoint.trim().is_empty() {
            return Err(Error::Config("upload.endpoint is not set".to_string()));
        }
        self.upload.validate()?;
        if self.probe_url.trim().is_empty() {
            return Err(Error::Config("probe_url is not set".to_string()));
        }
        if let Some(camera) = self.cameras.iter().find(|c| c.snapshot_url.trim().is_empty()) {
            return Err(Error::Config(format!(
                "snapshot_url for {} is not set",
                camera.camera
            )));
        }
        if self.probe_timeout_secs == 0 || self.probe_interval_secs == 0 {
            return Err(Error::Config("probe interval and timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Cameras with no snapshot endpoint; their triggers always fail.
    pub fn unconfigured_cameras(&self) -> Vec<CameraId> {
        CameraId::ALL
            .into_iter()
            .filter(|camera| !self.cameras.iter().any(|c| c.camera == *camera))
            .collect()
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_secs(self.retry_delay_secs))
            .with_max_delay(Duration::from_secs(self.max_retry_delay_secs))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::default()
            .with_probe_interval(Duration::from_secs(self.probe_interval_secs))
            .with_probe_timeout(Duration::from_secs(self.probe_timeout_secs))
            .with_offline_after_failures(self.offline_after_failures)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            max_queue_size: self.max_queue_size,
            drain_interval: self.drain_interval_secs.map(Duration::from_secs),
            retry: self.retry_config(),
            monitor: self.monitor_config(),
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_days * 24 * 60 * 60)
    }
}
