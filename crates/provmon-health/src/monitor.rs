//! Fault detector: background tasks that watch remote targets.
//!
//! `FaultDetector` spawns one task per monitored target. A task exits
//! after reporting its target unreachable; the owner decides whether to
//! start monitoring it again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provmon_core::MonitorConfig;

use crate::checker::{Liveness, LivenessCheck, LivenessTracker, ProbeResult};

const NOTICE_CAPACITY: usize = 64;

/// A monitored target stopped answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable {
    pub id: String,
    pub endpoint: String,
}

/// Liveness monitoring as seen by its consumers.
#[async_trait]
pub trait FaultProbe: Send + Sync {
    /// Start (or restart) watching `endpoint` under `id`.
    async fn start_monitoring(&self, id: &str, endpoint: &str);

    async fn stop_monitoring(&self, id: &str);

    /// Independent check after a failed remote call: `true` only when the
    /// target does not answer a fresh probe either.
    async fn confirm_unreachable(&self, id: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub unreachable_threshold: u32,
}

impl ProbeSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            interval: config.probe_interval(),
            timeout: config.probe_timeout(),
            unreachable_threshold: config.probe.unreachable_threshold,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unreachable_threshold: 3,
        }
    }
}

struct MonitorSlot {
    endpoint: String,
    generation: u64,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

type Slots = Arc<RwLock<HashMap<String, MonitorSlot>>>;

pub struct FaultDetector {
    check: Arc<dyn LivenessCheck>,
    settings: ProbeSettings,
    monitors: Slots,
    generation: AtomicU64,
    notices: mpsc::Sender<Unreachable>,
}

impl FaultDetector {
    /// Create a detector and the receiver its unreachable notices go to.
    pub fn new(
        check: Arc<dyn LivenessCheck>,
        settings: ProbeSettings,
    ) -> (Self, mpsc::Receiver<Unreachable>) {
        let (notices, rx) = mpsc::channel(NOTICE_CAPACITY);
        let detector = Self {
            check,
            settings,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
            notices,
        };
        (detector, rx)
    }

    pub async fn is_monitoring(&self, id: &str) -> bool {
        self.monitors.read().await.contains_key(id)
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        self.monitors.read().await.keys().cloned().collect()
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            slot.stop();
            debug!(target_id = %id, "monitor stopped");
        }
        info!("all fault monitors stopped");
    }
}

#[async_trait]
impl FaultProbe for FaultDetector {
    async fn start_monitoring(&self, id: &str, endpoint: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let target = Target {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            generation,
        };
        let check = self.check.clone();
        let settings = self.settings;
        let monitors = self.monitors.clone();
        let notices = self.notices.clone();

        let handle = tokio::spawn(async move {
            run_probe_loop(target, check, settings, monitors, notices, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            id.to_string(),
            MonitorSlot {
                endpoint: endpoint.to_string(),
                generation,
                handle,
                shutdown_tx,
            },
        ) {
            old.stop();
        }

        info!(target_id = %id, %endpoint, check = self.check.name(), "fault monitor started");
    }

    async fn stop_monitoring(&self, id: &str) {
        if let Some(slot) = self.monitors.write().await.remove(id) {
            slot.stop();
            info!(target_id = %id, "fault monitor stopped");
        }
    }

    async fn confirm_unreachable(&self, id: &str) -> bool {
        let endpoint = match self.monitors.read().await.get(id) {
            Some(slot) => slot.endpoint.clone(),
            None => {
                debug!(target_id = %id, "not monitored, cannot confirm");
                return false;
            }
        };
        let result = self.check.probe(&endpoint, self.settings.timeout).await;
        let gone = result != ProbeResult::Alive;
        debug!(target_id = %id, %endpoint, ?result, gone, "confirmation probe");
        gone
    }
}

struct Target {
    id: String,
    endpoint: String,
    generation: u64,
}

async fn run_probe_loop(
    target: Target,
    check: Arc<dyn LivenessCheck>,
    settings: ProbeSettings,
    monitors: Slots,
    notices: mpsc::Sender<Unreachable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = LivenessTracker::new(settings.unreachable_threshold, settings.interval);
    debug!(target_id = %target.id, endpoint = %target.endpoint, "probe loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tracker.next_interval()) => {
                let result = check.probe(&target.endpoint, settings.timeout).await;
                if tracker.record(result) == Liveness::Unreachable {
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!(target_id = %target.id, "probe loop shutting down");
                return;
            }
        }
    }

    // Only clear our own slot; a restart may already have replaced it.
    {
        let mut slots = monitors.write().await;
        if slots.get(&target.id).is_some_and(|s| s.generation == target.generation) {
            slots.remove(&target.id);
        }
    }

    let notice = Unreachable {
        id: target.id,
        endpoint: target.endpoint,
    };
    if notices.send(notice).await.is_err() {
        warn!("unreachable notice dropped, receiver closed");
    }
}
