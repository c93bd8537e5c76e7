//! Camsync Sync Engine
//!
//! This module gets captured images to remote storage, including:
//! - Direct upload with bounded in-place retries while online
//! - A bounded, disk-backed FIFO queue for offline captures
//! - Debounced connectivity monitoring
//! - Single-flight queue drain on reconnect, on a timer and on request

pub mod connectivity;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use connectivity::{ConnectivityMonitor, MonitorConfig};
pub use engine::{BackgroundTasks, CaptureOutcome, SyncConfig, SyncEngine};
pub use queue::{EnqueueOutcome, QueueInfo, QueueStore, RecoveryReport, DEFAULT_CAPACITY};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use scheduler::{DrainReport, DrainScheduler, DrainSchedulerHandle, DrainTrigger};
pub use state::{
    ImageRecord, LossReason, Payload, RecordStatus, StatsSnapshot, SyncStats, SyncStatusReport,
};
