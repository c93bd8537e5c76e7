//! Drain scheduling: on reconnect, on a periodic tick, and on operator request.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use camsync_common::{ConnectivityState, Error, Result};

/// Why a drain pass started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// Online when the scheduler started.
    Startup,
    /// Connectivity went from offline to online.
    Reconnected,
    /// Periodic sweep while online.
    Periodic,
    /// Operator asked for it.
    Forced,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Records delivered and removed.
    pub delivered: usize,
    /// Records removed without delivery.
    pub lost: usize,
    /// Stopped because connectivity dropped.
    pub interrupted: bool,
    /// Another pass was already running; nothing was done.
    pub already_running: bool,
    /// Records still queued when the pass ended.
    pub remaining: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

/// Drain request types.
#[derive(Debug)]
enum DrainRequest {
    /// Drain now and answer on the channel.
    Drain(oneshot::Sender<Result<DrainReport>>),
    /// Shutdown the scheduler.
    Shutdown,
}

/// Client side of the drain scheduler. Cheap to clone.
#[derive(Clone)]
pub struct DrainScheduler {
    request_tx: mpsc::Sender<DrainRequest>,
}

impl DrainScheduler {
    /// Create a scheduler; `periodic` enables the sweep while online.
    pub fn new(periodic: Option<Duration>) -> (Self, DrainSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (
            Self { request_tx },
            DrainSchedulerHandle {
                periodic,
                request_rx,
            },
        )
    }

    /// Ask for a drain pass and wait for its report.
    ///
    /// Behaves exactly like a reconnect-triggered pass.
    pub async fn force_drain(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(DrainRequest::Drain(response_tx))
            .await
            .map_err(|_| Error::NotFound("Drain scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::NotFound("Failed to receive drain result".to_string()))?
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(DrainRequest::Shutdown).await;
    }
}

/// Handle for the scheduler background task.
pub struct DrainSchedulerHandle {
    periodic: Option<Duration>,
    request_rx: mpsc::Receiver<DrainRequest>,
}

impl DrainSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `drain_fn` runs inline, so
    /// the scheduler itself never has two passes going at once.
    pub async fn run<F, Fut>(mut self, mut connectivity: watch::Receiver<ConnectivityState>, drain_fn: F)
    where
        F: Fn(DrainTrigger) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<DrainReport>> + Send,
    {
        let mut periodic = self.periodic.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        if let Some(ticker) = periodic.as_mut() {
            // The first tick completes immediately; startup is handled below.
            ticker.reset();
        }
        let mut connectivity_open = true;

        info!("Drain scheduler started");

        if connectivity.borrow_and_update().is_online() {
            Self::log_result(DrainTrigger::Startup, drain_fn(DrainTrigger::Startup).await);
        }

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(DrainRequest::Drain(response_tx)) => {
                            debug!("Processing forced drain request");
                            let _ = response_tx.send(drain_fn(DrainTrigger::Forced).await);
                        }
                        Some(DrainRequest::Shutdown) | None => {
                            info!("Drain scheduler shutting down");
                            break;
                        }
                    }
                }

                changed = connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        debug!("Connectivity channel closed; reconnect drains disabled");
                        connectivity_open = false;
                        continue;
                    }
                    if connectivity.borrow_and_update().is_online() {
                        Self::log_result(
                            DrainTrigger::Reconnected,
                            drain_fn(DrainTrigger::Reconnected).await,
                        );
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    if connectivity.borrow().is_online() {
                        debug!("Triggering periodic drain");
                        Self::log_result(DrainTrigger::Periodic, drain_fn(DrainTrigger::Periodic).await);
                    }
                }
            }
        }
    }

    async fn wait_for_periodic(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    fn log_result(trigger: DrainTrigger, result: Result<DrainReport>) {
        match result {
            Ok(report) if report.delivered > 0 || report.lost > 0 => {
                info!(
                    "Drain ({:?}) completed: {} delivered, {} lost, {} remaining",
                    trigger, report.delivered, report.lost, report.remaining
                );
            }
            Ok(_) => debug!("Drain ({:?}) had nothing to do", trigger),
            Err(e) => error!("Drain ({:?}) failed: {}", trigger, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn counting_drain(
        log: Arc<Mutex<Vec<DrainTrigger>>>,
    ) -> impl Fn(DrainTrigger) -> std::future::Ready<Result<DrainReport>> + Send + Sync + 'static
    {
        move |trigger| {
            log.lock().unwrap().push(trigger);
            std::future::ready(Ok(DrainReport {
                delivered: 1,
                ..DrainReport::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_forced_drain() {
        let (scheduler, handle) = DrainScheduler::new(None);
        let (_state_tx, state_rx) = watch::channel(ConnectivityState::Offline);
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(handle.run(state_rx, counting_drain(log.clone())));

        let report = scheduler.force_drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec![DrainTrigger::Forced]);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let (scheduler, handle) = DrainScheduler::new(None);
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Offline);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let (done_tx, mut done_rx) = mpsc::channel(4);

        let task = tokio::spawn(handle.run(state_rx, move |trigger| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            let done_tx = done_tx.clone();
            async move {
                let _ = done_tx.send(trigger).await;
                Ok(DrainReport::default())
            }
        }));

        // Once a request has been answered the loop is running, so the
        // next transition counts as a reconnect rather than startup.
        scheduler.force_drain().await.unwrap();
        assert_eq!(done_rx.recv().await, Some(DrainTrigger::Forced));

        state_tx.send(ConnectivityState::Online).unwrap();
        assert_eq!(done_rx.recv().await, Some(DrainTrigger::Reconnected));

        // Going offline does not drain.
        state_tx.send(ConnectivityState::Offline).unwrap();
        scheduler.force_drain().await.unwrap();
        assert_eq!(done_rx.recv().await, Some(DrainTrigger::Forced));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_drain_when_online() {
        let (scheduler, handle) = DrainScheduler::new(None);
        let (_state_tx, state_rx) = watch::channel(ConnectivityState::Online);
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(handle.run(state_rx, counting_drain(log.clone())));
        scheduler.force_drain().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![DrainTrigger::Startup, DrainTrigger::Forced]
        );
        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_drain_only_while_online() {
        let (scheduler, handle) = DrainScheduler::new(Some(Duration::from_millis(10)));
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Offline);
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(handle.run(state_rx, counting_drain(log.clone())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());

        state_tx.send(ConnectivityState::Online).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&DrainTrigger::Reconnected));
        assert!(log.contains(&DrainTrigger::Periodic));
    }

    #[tokio::test]
    async fn test_force_drain_without_scheduler_fails() {
        let (scheduler, handle) = DrainScheduler::new(None);
        drop(handle);
        assert!(scheduler.force_drain().await.is_err());
    }
}
