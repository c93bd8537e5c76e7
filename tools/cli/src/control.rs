//! Local control socket of a running daemon.
//!
//! `camsync run` owns the queue directory. Other `camsync` invocations reach
//! its engine through a Unix socket in the data directory instead of opening
//! the queue themselves. Messages are JSON with a 4-byte big-endian length
//! prefix; one request and one response per connection.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use camsync_common::{CameraId, ImageId};
use camsync_sync::{
    CaptureOutcome, DrainReport, DrainScheduler, ImageRecord, QueueInfo, RecordStatus,
    SyncEngine, SyncStatusReport,
};

/// Socket file name inside the data directory.
pub const SOCKET_FILE: &str = "control.sock";

/// Maximum message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for requests that never wait on an upload.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SOCKET_FILE)
}

/// Request sent from the CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Capture one image from a camera.
    Capture { camera: CameraId },
    /// Drain through the daemon's scheduler.
    Drain,
    Status,
    /// Queue summary and contents.
    Queue,
    /// Delete archived evicted images; `None` uses the daemon's retention.
    Prune { days: Option<u64> },
}

impl ControlRequest {
    /// Captures and drains may sit out retry delays, so they get no deadline.
    fn response_timeout(&self) -> Option<Duration> {
        match self {
            ControlRequest::Capture { .. } | ControlRequest::Drain => None,
            _ => Some(QUERY_TIMEOUT),
        }
    }
}

/// One queued image as listed over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedImage {
    pub id: ImageId,
    pub camera_id: CameraId,
    pub captured_at: DateTime<Utc>,
    pub size: u64,
    pub attempt_count: u32,
    pub status: RecordStatus,
}

impl From<&ImageRecord> for QueuedImage {
    fn from(record: &ImageRecord) -> Self {
        Self {
            id: record.id,
            camera_id: record.camera_id,
            captured_at: record.captured_at,
            size: record.size,
            attempt_count: record.attempt_count,
            status: record.status,
        }
    }
}

/// Response sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Captured { outcome: CaptureOutcome },
    Drained { report: DrainReport },
    Status { status: SyncStatusReport },
    Queue { info: QueueInfo, images: Vec<QueuedImage> },
    Pruned { count: usize },
    Error { message: String },
}

/// Read one length-prefixed JSON message.
pub async fn read_message<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_MESSAGE_SIZE {
        bail!("message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE);
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).context("Malformed control message")
}

/// Write one length-prefixed JSON message.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(message)?;
    let len = u32::try_from(json.len()).context("message too large")?;
    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Send `request` to the daemon listening on `socket`.
///
/// Returns `None` when no daemon is listening there.
pub async fn call_daemon(socket: &Path, request: &ControlRequest) -> Result<Option<ControlResponse>> {
    let mut stream = match timeout(CONNECT_TIMEOUT, UnixStream::connect(socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            debug!("No daemon at {}: {}", socket.display(), e);
            return Ok(None);
        }
        Ok(Err(e)) => {
            return Err(e).with_context(|| format!("Failed to connect to {}", socket.display()))
        }
        Err(_) => bail!("Timed out connecting to daemon at {}", socket.display()),
    };

    write_message(&mut stream, request).await?;
    let response = match request.response_timeout() {
        Some(limit) => timeout(limit, read_message(&mut stream))
            .await
            .context("Timed out waiting for the daemon")??,
        None => read_message(&mut stream).await?,
    };
    Ok(Some(response))
}

/// Daemon side of the control socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    archive_retention: Duration,
}

impl ControlServer {
    /// Bind at `path`, replacing a stale socket file.
    ///
    /// Call only while holding the queue lock; any socket found is then
    /// left over from a daemon that did not shut down cleanly.
    pub fn bind(path: &Path, archive_retention: Duration) -> Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove stale socket {}", path.display()))
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            archive_retention,
        })
    }

    /// Serve requests until `shutdown` flips to true.
    pub async fn run(
        self,
        engine: Arc<SyncEngine>,
        scheduler: DrainScheduler,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Control socket on {}", self.path.display());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let engine = Arc::clone(&engine);
                        let scheduler = scheduler.clone();
                        let retention = self.archive_retention;
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, &engine, &scheduler, retention).await {
                                warn!("Control request failed: {:#}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept control connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Control socket shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve(
    mut stream: UnixStream,
    engine: &SyncEngine,
    scheduler: &DrainScheduler,
    archive_retention: Duration,
) -> Result<()> {
    let request: ControlRequest = timeout(QUERY_TIMEOUT, read_message(&mut stream))
        .await
        .context("Timed out reading control request")??;
    debug!("Control request: {:?}", request);

    let response = dispatch(request, engine, scheduler, archive_retention).await;
    write_message(&mut stream, &response).await
}

async fn dispatch(
    request: ControlRequest,
    engine: &SyncEngine,
    scheduler: &DrainScheduler,
    archive_retention: Duration,
) -> ControlResponse {
    let result = match request {
        ControlRequest::Capture { camera } => engine
            .handle_capture(camera)
            .await
            .map(|outcome| ControlResponse::Captured { outcome }),
        ControlRequest::Drain => scheduler
            .force_drain()
            .await
            .map(|report| ControlResponse::Drained { report }),
        ControlRequest::Status => Ok(ControlResponse::Status {
            status: engine.status().await,
        }),
        ControlRequest::Queue => {
            let images = engine.list_queue().await.iter().map(QueuedImage::from).collect();
            Ok(ControlResponse::Queue {
                info: engine.queue_info().await,
                images,
            })
        }
        ControlRequest::Prune { days } => {
            let max_age = days
                .map(|days| Duration::from_secs(days * 24 * 60 * 60))
                .unwrap_or(archive_retention);
            engine
                .prune_archive(max_age)
                .await
                .map(|count| ControlResponse::Pruned { count })
        }
    };

    result.unwrap_or_else(|e| ControlResponse::Error {
        message: e.to_string(),
    })
}
