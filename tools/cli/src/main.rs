//! Camsync CLI - capture-to-cloud sync daemon and operator commands.
//!
//! `camsync run` listens for triggers, uploads captures directly while
//! online and queues them locally while offline. The other commands inspect
//! and operate on the same queue.

mod config;
mod control;
mod trigger;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use camsync_common::{CameraId, ConnectivityState, Error, UnmappedTriggerPolicy};
use camsync_net::{HttpProbe, HttpSnapshotSource, HttpUploadClient, ReachabilityProbe};
use camsync_sync::{CaptureOutcome, DrainReport, QueueInfo, QueueStore, RecoveryReport, SyncEngine};

use crate::config::AppConfig;
use crate::control::{ControlRequest, ControlResponse, ControlServer, QueuedImage};
use crate::trigger::TriggerListener;

#[derive(Parser)]
#[command(name = "camsync")]
#[command(about = "Camsync - offline-first camera capture upload")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/camsync/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trigger listener, connectivity monitor and queue drain.
    Run,

    /// Capture and upload (or queue) one image.
    Capture {
        /// Camera name or trigger text, e.g. "camera_2" or "rfid_1".
        camera: String,
    },

    /// Upload queued images now.
    Drain,

    /// Inspect the local queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Check connectivity once.
    Probe,

    /// Show connectivity and queue status as JSON.
    Status,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued images, oldest first.
    List,

    /// Print the number of queued images.
    Count,

    /// Show queue storage information.
    Info,

    /// Delete archived evicted images.
    Prune {
        /// Keep archived images younger than this many days (default from config).
        #[arg(short, long)]
        days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Run => cmd_run(config).await,

        Commands::Capture { camera } => cmd_capture(config, &camera).await,

        Commands::Drain => cmd_drain(config).await,

        Commands::Queue { command } => match command {
            QueueCommands::List => cmd_queue_list(config).await,
            QueueCommands::Count => cmd_queue_count(config).await,
            QueueCommands::Info => cmd_queue_info(config).await,
            QueueCommands::Prune { days } => cmd_queue_prune(config, days).await,
        },

        Commands::Probe => cmd_probe(config).await,

        Commands::Status => cmd_status(config).await,
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camsync")
        .join("config.json")
}

/// Turn a failed queue open into an operator-facing error.
fn queue_open_error(config: &AppConfig, err: Error) -> anyhow::Error {
    match err {
        Error::Locked(_) => anyhow!(
            "The queue in {} belongs to another camsync process that is not accepting commands",
            config.data_dir.display()
        ),
        err => anyhow::Error::new(err)
            .context(format!("Failed to open queue in {}", config.data_dir.display())),
    }
}

/// Build the engine with the HTTP collaborators.
async fn build_engine(config: &AppConfig) -> Result<Arc<SyncEngine>> {
    config.validate().context("Invalid configuration")?;
    for camera in config.unconfigured_cameras() {
        warn!("No snapshot_url for {}; its triggers will fail", camera);
    }

    let uploader = Arc::new(
        HttpUploadClient::new(&config.upload).context("Failed to create upload client")?,
    );
    let capture = Arc::new(
        HttpSnapshotSource::new(&config.cameras, config.capture_timeout())
            .context("Failed to configure cameras")?,
    );
    let probe = Arc::new(
        HttpProbe::new(&config.probe_url, config.monitor_config().probe_timeout)
            .context("Failed to create connectivity probe")?,
    );

    let engine = SyncEngine::new(
        &config.data_dir,
        uploader,
        capture,
        probe,
        config.sync_config(),
    )
    .await
    .map_err(|e| queue_open_error(config, e))?;

    Ok(Arc::new(engine))
}

/// Open the queue directly, without the network collaborators.
async fn open_queue(config: &AppConfig) -> Result<QueueStore> {
    config.validate_storage().context("Invalid configuration")?;
    QueueStore::open(&config.data_dir, config.max_queue_size)
        .await
        .map_err(|e| queue_open_error(config, e))
}

/// Forward `request` to a running daemon, if there is one.
async fn call_daemon(config: &AppConfig, request: ControlRequest) -> Result<Option<ControlResponse>> {
    let socket = control::socket_path(&config.data_dir);
    match control::call_daemon(&socket, &request).await? {
        Some(ControlResponse::Error { message }) => Err(anyhow!("Daemon: {}", message)),
        response => Ok(response),
    }
}

fn unexpected(response: ControlResponse) -> anyhow::Error {
    anyhow!("Unexpected daemon response: {:?}", response)
}

/// Run the daemon until interrupted.
async fn cmd_run(config: AppConfig) -> Result<()> {
    let engine = build_engine(&config).await?;

    match engine.prune_archive(config.archive_retention()).await {
        Ok(0) => {}
        Ok(pruned) => info!("Pruned {} archived images", pruned),
        Err(e) => warn!("Failed to prune eviction archive: {}", e),
    }

    let tasks = engine.spawn_background();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_server = ControlServer::bind(
        &control::socket_path(&config.data_dir),
        config.archive_retention(),
    )?;
    let control_task = tokio::spawn(control_server.run(
        Arc::clone(&engine),
        tasks.scheduler().clone(),
        shutdown_rx.clone(),
    ));

    let listener = TriggerListener::bind(&config.trigger_bind, config.unmapped_trigger).await?;
    let dispatch_engine = Arc::clone(&engine);
    let listener_task = tokio::spawn(listener.run(
        move |camera| {
            let _ = dispatch_engine.spawn_capture(camera);
        },
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = listener_task.await {
        warn!("Trigger listener task failed: {}", e);
    }
    if let Err(e) = control_task.await {
        warn!("Control socket task failed: {}", e);
    }
    tasks.shutdown().await;

    let status = engine.status().await;
    info!(
        "Session: {} captures, {} delivered, {} still queued, {} lost",
        status.stats.captures,
        status.stats.delivered_direct + status.stats.delivered_from_queue,
        status.pending,
        status.stats.total_lost()
    );

    Ok(())
}

/// Capture one image, through the daemon when it is running.
async fn cmd_capture(config: AppConfig, camera: &str) -> Result<()> {
    let camera = UnmappedTriggerPolicy::Reject
        .resolve(camera)
        .context("Unknown camera")?;

    let outcome = match call_daemon(&config, ControlRequest::Capture { camera }).await? {
        Some(ControlResponse::Captured { outcome }) => outcome,
        Some(other) => return Err(unexpected(other)),
        None => {
            let engine = build_engine(&config).await?;
            let state = engine.monitor().probe().await;
            info!("Connectivity: {}", state);
            engine.handle_capture(camera).await?
        }
    };

    print_capture_outcome(camera, outcome)
}

fn print_capture_outcome(camera: CameraId, outcome: CaptureOutcome) -> Result<()> {
    match outcome {
        CaptureOutcome::Delivered { id, location, .. } => {
            println!("Delivered {} from {}", id, camera);
            if let Some(location) = location {
                println!("  Location: {}", location);
            }
        }
        CaptureOutcome::Queued { id, evicted, .. } => {
            println!("Queued {} from {}", id, camera);
            if let Some(evicted) = evicted {
                println!("  Evicted oldest queued image {}", evicted);
            }
        }
        CaptureOutcome::Lost { id, reason, .. } => {
            anyhow::bail!("Image {} from {} lost: {}", id, camera, reason);
        }
        CaptureOutcome::CaptureFailed { reason, .. } => {
            return Err(Error::Capture(reason).into());
        }
    }

    Ok(())
}

/// Drain the queue once, through the daemon's scheduler when it is running.
async fn cmd_drain(config: AppConfig) -> Result<()> {
    let report = match call_daemon(&config, ControlRequest::Drain).await? {
        Some(ControlResponse::Drained { report }) => report,
        Some(other) => return Err(unexpected(other)),
        None => {
            let engine = build_engine(&config).await?;
            let state = engine.monitor().probe().await;
            if !state.is_online() {
                println!("Offline; {} images remain queued", engine.queue_count().await);
                return Ok(());
            }
            engine.force_drain().await.context("Drain failed")?
        }
    };

    print_drain_report(&report);
    Ok(())
}

fn print_drain_report(report: &DrainReport) {
    if report.already_running {
        println!("A drain is already running; {} images queued", report.remaining);
        return;
    }
    println!("Drain finished in {:.1?}", report.duration);
    println!("  Delivered: {}", report.delivered);
    println!("  Lost: {}", report.lost);
    println!("  Remaining: {}", report.remaining);
    if report.interrupted {
        println!("  Stopped early: connectivity lost");
    }
}

/// Queue summary from the daemon, or from disk when none is running.
///
/// The recovery report is only available when the queue was opened here.
async fn queue_snapshot(
    config: &AppConfig,
) -> Result<(QueueInfo, Vec<QueuedImage>, Option<RecoveryReport>)> {
    match call_daemon(config, ControlRequest::Queue).await? {
        Some(ControlResponse::Queue { info, images }) => Ok((info, images, None)),
        Some(other) => Err(unexpected(other)),
        None => {
            let queue = open_queue(config).await?;
            let images = queue.list_all().iter().map(QueuedImage::from).collect();
            Ok((queue.info(), images, Some(queue.recovery_report().clone())))
        }
    }
}

/// List queued images.
async fn cmd_queue_list(config: AppConfig) -> Result<()> {
    let (_, images, _) = queue_snapshot(&config).await?;

    if images.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    println!("Queued images ({}):", images.len());
    for image in images {
        println!(
            "  {}  {}  {}  {} bytes  {} failed attempts  {}",
            image.id,
            image.camera_id,
            image.captured_at.format("%Y-%m-%d %H:%M:%S"),
            image.size,
            image.attempt_count,
            image.status
        );
    }

    Ok(())
}

async fn cmd_queue_count(config: AppConfig) -> Result<()> {
    let (info, _, _) = queue_snapshot(&config).await?;
    println!("{}", info.count);
    Ok(())
}

/// Show queue storage information.
async fn cmd_queue_info(config: AppConfig) -> Result<()> {
    let (info, _, recovery) = queue_snapshot(&config).await?;

    println!("Queue Information:");
    println!("  Directory: {}", info.storage_dir.display());
    println!("  Queued: {}/{}", info.count, info.capacity);
    println!("  Size: {} bytes", info.total_size_bytes);
    if let (Some(oldest), Some(newest)) = (info.oldest, info.newest) {
        println!("  Oldest: {}", oldest);
        println!("  Newest: {}", newest);
    }
    if let Some(recovery) = recovery {
        if recovery.quarantined > 0 || !recovery.evicted.is_empty() {
            println!("  Quarantined on open: {}", recovery.quarantined);
            println!("  Evicted on open: {}", recovery.evicted.len());
        }
    }

    Ok(())
}

async fn cmd_queue_prune(config: AppConfig, days: Option<u64>) -> Result<()> {
    let pruned = match call_daemon(&config, ControlRequest::Prune { days }).await? {
        Some(ControlResponse::Pruned { count }) => count,
        Some(other) => return Err(unexpected(other)),
        None => {
            let queue = open_queue(&config).await?;
            let max_age = match days {
                Some(days) => std::time::Duration::from_secs(days * 24 * 60 * 60),
                None => config.archive_retention(),
            };
            queue
                .prune_archive(max_age)
                .await
                .context("Failed to prune eviction archive")?
        }
    };

    println!("Pruned {} archived images", pruned);
    Ok(())
}

/// Probe connectivity once.
async fn cmd_probe(config: AppConfig) -> Result<()> {
    let timeout = config.monitor_config().probe_timeout;
    let probe = HttpProbe::new(&config.probe_url, timeout).context("Invalid probe_url")?;

    let state = tokio::time::timeout(timeout, probe.probe())
        .await
        .unwrap_or(ConnectivityState::Offline);
    println!("{}: {}", config.probe_url, state);
    Ok(())
}

/// Print status as JSON, from the daemon when it is running.
async fn cmd_status(config: AppConfig) -> Result<()> {
    let status = match call_daemon(&config, ControlRequest::Status).await? {
        Some(ControlResponse::Status { status }) => status,
        Some(other) => return Err(unexpected(other)),
        None => {
            let engine = build_engine(&config).await?;
            engine.monitor().probe().await;
            engine.status().await
        }
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
