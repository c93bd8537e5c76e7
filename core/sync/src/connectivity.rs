//! Connectivity monitoring with debounced state changes.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use camsync_common::ConnectivityState;
use camsync_net::ReachabilityProbe;

/// Configuration for the connectivity monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between probes.
    pub probe_interval: Duration,
    /// Upper bound on a single probe; a probe that overruns counts as offline.
    pub probe_timeout: Duration,
    /// Consecutive failed probes needed to go from online to offline.
    pub offline_after_failures: u32,
}

impl MonitorConfig {
    /// Set probe interval.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the failure count that flips the state to offline. Zero is
    /// treated as one.
    pub fn with_offline_after_failures(mut self, failures: u32) -> Self {
        self.offline_after_failures = failures.max(1);
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            offline_after_failures: 2,
        }
    }
}

/// Tracks whether the remote is reachable and publishes state changes.
///
/// The upward edge is immediate: one successful probe after being offline
/// flips to online. The downward edge waits for
/// `offline_after_failures` consecutive failures, and failures while already
/// offline publish nothing.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    config: MonitorConfig,
    state_tx: watch::Sender<ConnectivityState>,
    consecutive_failures: AtomicU32,
    last_check: RwLock<Option<DateTime<Utc>>>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in `initial` state.
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        config: MonitorConfig,
        initial: ConnectivityState,
    ) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            probe,
            config,
            state_tx,
            consecutive_failures: AtomicU32::new(0),
            last_check: RwLock::new(None),
        }
    }

    /// Current debounced state.
    pub fn current(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Receive every published state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Time of the last completed probe.
    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.last_check.read().ok().and_then(|guard| *guard)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one bounded probe and fold its result into the state.
    pub async fn probe(&self) -> ConnectivityState {
        let observed = match timeout(self.config.probe_timeout, self.probe.probe()).await {
            Ok(state) => state,
            Err(_) => {
                debug!("Connectivity probe timed out after {:?}", self.config.probe_timeout);
                ConnectivityState::Offline
            }
        };
        if let Ok(mut guard) = self.last_check.write() {
            *guard = Some(Utc::now());
        }
        self.observe(observed)
    }

    /// Fold one raw observation into the debounced state and return it.
    pub fn observe(&self, observed: ConnectivityState) -> ConnectivityState {
        match observed {
            ConnectivityState::Online => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let changed = self.state_tx.send_if_modified(|state| {
                    if *state == ConnectivityState::Online {
                        false
                    } else {
                        *state = ConnectivityState::Online;
                        true
                    }
                });
                if changed {
                    info!("Connectivity restored");
                }
            }
            ConnectivityState::Offline => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let threshold = self.config.offline_after_failures.max(1);
                let changed = self.state_tx.send_if_modified(|state| {
                    if *state == ConnectivityState::Online && failures >= threshold {
                        *state = ConnectivityState::Offline;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    warn!("Connectivity lost after {} failed probe(s)", failures);
                } else if self.current().is_online() {
                    debug!("Probe failed ({}/{}), still online", failures, threshold);
                }
            }
        }
        self.current()
    }

    /// Probe on a fixed interval until `shutdown` flips to true.
    ///
    /// The first probe runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Connectivity monitor started (every {:?}, timeout {:?})",
            self.config.probe_interval, self.config.probe_timeout
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Connectivity monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
