//! # Auto-Sync Scheduler
//!
//! Decides when to run a pass.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Scheduler Loop                                  │
//! │                                                                         │
//! │   tokio::select! {                                                      │
//! │     shutdown            ──► exit                                        │
//! │     interval tick       ──► sync if online && pending > 0               │
//! │     WentOnline          ──► sync if pending > 0                         │
//! │     local write signal  ──► sync if online                              │
//! │   }                                                                     │
//! │                                                                         │
//! │   Passes run inline, so triggers arriving meanwhile are dropped (the    │
//! │   queued write signal is drained after each pass), never stacked.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::orchestrator::SyncOrchestrator;

type SignalSlot = Arc<tokio::sync::Mutex<Option<mpsc::Receiver<()>>>>;

struct Running {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Background trigger for sync passes.
pub struct AutoSyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    monitor: ConnectivityMonitor,
    interval: Duration,
    signals: SignalSlot,
    running: Mutex<Option<Running>>,
}

impl AutoSyncScheduler {
    /// `signals` is the write-signal receiver from `ReplicaStore::new`.
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        monitor: ConnectivityMonitor,
        interval: Duration,
        signals: Option<mpsc::Receiver<()>>,
    ) -> Self {
        AutoSyncScheduler {
            orchestrator,
            monitor,
            interval,
            signals: Arc::new(tokio::sync::Mutex::new(signals)),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Starts the loop. Calling it while running does nothing.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        // Subscribe now so an edge reported right after start is not missed.
        let events = self.monitor.subscribe();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.orchestrator),
            self.interval,
            events,
            Arc::clone(&self.signals),
            shutdown_rx,
        ));

        *running = Some(Running { shutdown, handle });
        info!(interval_ms = self.interval.as_millis() as u64, "Auto-sync scheduler started");
    }

    /// Stops the loop, letting an in-flight pass finish. Idempotent.
    pub async fn stop(&self) {
        let running = self.running().take();
        if let Some(Running { shutdown, handle }) = running {
            let _ = shutdown.send(()).await;
            let _ = handle.await;
            info!("Auto-sync scheduler stopped");
        }
    }
}

impl std::fmt::Debug for AutoSyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSyncScheduler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_loop(
    orchestrator: Arc<SyncOrchestrator>,
    period: Duration,
    mut events: broadcast::Receiver<ConnectivityEvent>,
    signals: SignalSlot,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut signals = signals.lock().await;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    loop {
        let reason = tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let status = orchestrator.tracker().snapshot();
                if !(status.is_online && status.pending_changes > 0) {
                    continue;
                }
                "interval"
            }
            event = events.recv(), if events_open => match event {
                Ok(ConnectivityEvent::WentOnline) => {
                    if orchestrator.tracker().snapshot().pending_changes == 0 {
                        continue;
                    }
                    "connectivity"
                }
                Ok(ConnectivityEvent::WentOffline) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Scheduler missed connectivity events");
                    continue;
                }
                Err(RecvError::Closed) => {
                    events_open = false;
                    continue;
                }
            },
            Some(()) = next_signal(&mut signals) => {
                if !orchestrator.tracker().snapshot().is_online {
                    continue;
                }
                "local write"
            }
        };

        debug!(reason, "Scheduler triggering sync");
        let report = orchestrator.perform_sync().await;
        debug!(reason, outcome = ?report.outcome, "Scheduled sync finished");

        // Writes during the pass are still pending; the next tick covers them.
        if let Some(rx) = signals.as_mut() {
            while rx.try_recv().is_ok() {}
        }
    }

    debug!("Scheduler loop exited");
}
