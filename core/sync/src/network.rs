//! Connectivity tracking with debounce.
//!
//! Raw signals arrive through [`NetworkMonitor::report`] or a polled
//! [`ConnectivityProbe`]. Going offline is published immediately; coming
//! back online is published only once the raw signal has stayed online for
//! `stable_for` without interruption. Subscribers see transitions only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use shopsync_remote::RemoteSystem;

/// Connectivity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How long the raw signal must stay online before it counts.
    pub stable_for_ms: u64,
    /// Probe polling interval.
    pub probe_interval_ms: u64,
}

impl NetworkConfig {
    pub fn stable_for(&self) -> Duration {
        Duration::from_millis(self.stable_for_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stable_for_ms: 1_000,
            probe_interval_ms: 5_000,
        }
    }
}

/// Source of raw connectivity readings.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the backend is reachable right now.
    async fn probe(&self) -> bool;
}

/// Probe that pings a remote system.
pub struct RemoteProbe {
    remote: Arc<dyn RemoteSystem>,
}

impl RemoteProbe {
    pub fn new(remote: Arc<dyn RemoteSystem>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl ConnectivityProbe for RemoteProbe {
    async fn probe(&self) -> bool {
        self.remote.ping().await.is_ok()
    }
}

/// Debounced online/offline state.
pub struct NetworkMonitor {
    raw: watch::Sender<bool>,
    state: Arc<watch::Sender<bool>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Create a monitor. An initial online state is trusted without debounce.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(initially_online: bool, stable_for: Duration) -> Arc<Self> {
        let (raw, raw_rx) = watch::channel(initially_online);
        let (state, _) = watch::channel(initially_online);
        let state = Arc::new(state);

        let task = tokio::spawn(debounce(raw_rx, state.clone(), stable_for));

        Arc::new(Self {
            raw,
            state,
            debounce: Mutex::new(Some(task)),
        })
    }

    /// Debounced connectivity.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Feed a raw connectivity reading.
    pub fn report(&self, online: bool) {
        if !online {
            let changed = self.state.send_if_modified(|state| std::mem::replace(state, false));
            if changed {
                info!("Network offline");
            }
        }
        // Repeated identical readings must not restart the stability window.
        self.raw
            .send_if_modified(|raw| std::mem::replace(raw, online) != online);
    }

    /// Receive debounced transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Call `listener` on every debounced transition until the monitor is dropped.
    pub fn on_change<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                listener(online);
            }
        })
    }

    /// Poll `probe` every `interval`, reporting each reading.
    pub fn spawn_probe(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let online = probe.probe().await;
                match monitor.upgrade() {
                    Some(monitor) => monitor.report(online),
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Ok(mut task) = self.debounce.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn debounce(
    mut raw: watch::Receiver<bool>,
    state: Arc<watch::Sender<bool>>,
    stable_for: Duration,
) {
    loop {
        let online = *raw.borrow_and_update();

        if !online || *state.borrow() {
            if raw.changed().await.is_err() {
                break;
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(stable_for) => {
                let changed = state.send_if_modified(|state| !std::mem::replace(state, true));
                if changed {
                    info!("Network online");
                }
            }
            res = raw.changed() => {
                if res.is_err() {
                    break;
                }
                debug!("Connectivity flapped; restarting stability window");
            }
        }
    }
}
