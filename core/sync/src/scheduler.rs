//! Sync scheduling: startup, connectivity, manual, periodic and retry triggers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use shopsync_common::{Error, Result};

use crate::engine::{DrainReport, SkipReason, SyncEngine};

/// When drains run besides startup and reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Manual sync only.
    #[default]
    Manual,
    /// Sync triggered immediately on local changes.
    OnDemand,
    /// Sync at regular intervals.
    Periodic { interval_secs: u64 },
    /// Both on-demand and periodic.
    Hybrid { interval_secs: u64 },
}

impl SyncMode {
    fn period(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval_secs } | SyncMode::Hybrid { interval_secs } => {
                Some(Duration::from_secs((*interval_secs).max(1)))
            }
            _ => None,
        }
    }

    fn on_change(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Drain everything now.
    Full,
    /// Stop the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<DrainReport>>;

/// Front end for requesting drains from the background task.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Option<Reply>)>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let changed = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            changed: changed.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            changed,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a full drain and wait for its report.
    pub async fn request_sync(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Full, Some(response_tx)))
            .await
            .map_err(|_| Error::Unavailable("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Unavailable("Failed to receive sync result".to_string()))?
    }

    /// Notify the scheduler of a local change. Ignored in manual and periodic modes.
    ///
    /// Notifications that arrive while a pass runs collapse into one
    /// follow-up pass.
    pub fn notify_change(&self) {
        let mode = self.get_mode();
        if !mode.on_change() {
            debug!("Change notification ignored (mode: {:?})", mode);
            return;
        }
        self.changed.notify_one();
    }

    /// Change the sync mode.
    pub fn set_mode(&self, mode: SyncMode) {
        if let Ok(mut current) = self.mode.write() {
            *current = mode;
        }
    }

    /// Get current sync mode.
    pub fn get_mode(&self) -> SyncMode {
        self.mode.read().map(|m| *m).unwrap_or_default()
    }

    /// Token that stops the scheduler and interrupts a running drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Option<Reply>)>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
}

impl SyncSchedulerHandle {
    fn mode(&self) -> SyncMode {
        self.mode.read().map(|m| *m).unwrap_or_default()
    }

    /// Run the scheduler until shutdown.
    ///
    /// This should be spawned in a tokio task. `online` carries debounced
    /// connectivity; every transition to online triggers a drain.
    pub async fn run(mut self, engine: Arc<SyncEngine>, online: watch::Receiver<bool>) {
        let mut online = Some(online);
        let mut period = self.mode().period();
        let mut periodic = period.map(periodic_interval);

        info!("Sync scheduler started");

        let mut ran = engine.network().is_online();
        if ran {
            self.drain(&engine, "startup").await;
        }

        loop {
            if ran && self.answer_waiting() {
                info!("Received shutdown request");
                break;
            }

            let retry_in = retry_delay(&engine);

            ran = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                request = self.request_rx.recv() => {
                    match request {
                        None | Some((SyncRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        Some((request, reply)) => {
                            debug!("Processing sync request: {:?}", request);
                            let result = engine.drain_with(&self.shutdown).await;
                            if let Err(e) = &result {
                                error!("Requested sync failed: {}", e);
                            }
                            if let Some(reply) = reply {
                                let _ = reply.send(result);
                            }
                            true
                        }
                    }
                }

                _ = self.changed.notified() => {
                    self.drain(&engine, "local change").await;
                    true
                }

                came_online = wait_online(&mut online) => {
                    if came_online {
                        self.drain(&engine, "reconnect").await;
                    }
                    came_online
                }

                _ = wait_periodic(&mut periodic) => {
                    self.drain(&engine, "periodic").await;
                    true
                }

                _ = wait_retry(retry_in) => {
                    self.drain(&engine, "retry timer").await;
                    true
                }
            };

            let current = self.mode().period();
            if current != period {
                period = current;
                periodic = period.map(periodic_interval);
            }
        }
    }

    /// Answer requests that queued up behind a finished pass with a skipped
    /// report. Returns whether a shutdown request was among them.
    fn answer_waiting(&mut self) -> bool {
        while let Ok((request, reply)) = self.request_rx.try_recv() {
            if request == SyncRequest::Shutdown {
                return true;
            }
            debug!("Sync request arrived during a pass; skipping");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(DrainReport::skipped(SkipReason::AlreadyDraining)));
            }
        }
        false
    }

    async fn drain(&self, engine: &SyncEngine, trigger: &str) {
        debug!("Triggering {} sync", trigger);
        match engine.drain_with(&self.shutdown).await {
            Ok(report) if report.is_skipped() => {
                debug!("{} sync skipped: {:?}", trigger, report.skipped);
            }
            Ok(report) => {
                debug!(
                    "{} sync completed: {} synced, {} pending retry",
                    trigger,
                    report.synced(),
                    report.retried
                );
            }
            Err(e) => error!("{} sync failed: {}", trigger, e),
        }
    }
}

fn periodic_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Time until the earliest backed-off operation is due, if it lies ahead.
fn retry_delay(engine: &SyncEngine) -> Option<Duration> {
    let next = match engine.next_retry_at() {
        Ok(next) => next?,
        Err(e) => {
            error!("Failed to read retry schedule: {}", e);
            return None;
        }
    };
    (next - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}

async fn wait_online(online: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = online.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        *online = None;
        return false;
    }
    let is_online = *rx.borrow_and_update();
    is_online
}

async fn wait_periodic(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_retry(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
