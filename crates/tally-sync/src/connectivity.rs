//! # Connectivity Monitor
//!
//! Turns reachability reports into status transitions and broadcast events.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  NetworkReachability ── watch<bool> ──► ConnectivityMonitor task        │
//! │  (OS hook, ping, or                           │                         │
//! │   ManualReachability)                         ▼                         │
//! │                              tracker.connectivity_changed(online)       │
//! │                                    │ changed?                           │
//! │                                    ▼                                    │
//! │                  broadcast: WentOnline / WentOffline ──► scheduler      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Repeated reports of the same reachability produce no event.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::tracker::SyncStatusTracker;

/// Source of reachability reports.
pub trait NetworkReachability: Send + Sync + 'static {
    /// Receiver holding the latest reachability, `true` when online.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability driven by explicit calls. Used by tests, the simulator and
/// hosts that already own a network callback.
#[derive(Debug)]
pub struct ManualReachability {
    tx: watch::Sender<bool>,
}

impl ManualReachability {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        ManualReachability { tx }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

impl NetworkReachability for ManualReachability {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Edge in reachability, after de-duplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

struct Running {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Watches reachability and feeds the status tracker.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    reachability: Arc<dyn NetworkReachability>,
    tracker: Arc<SyncStatusTracker>,
    events: broadcast::Sender<ConnectivityEvent>,
    running: Arc<Mutex<Option<Running>>>,
}

impl ConnectivityMonitor {
    pub fn new(reachability: Arc<dyn NetworkReachability>, tracker: Arc<SyncStatusTracker>) -> Self {
        let (events, _) = broadcast::channel(16);
        ConnectivityMonitor {
            reachability,
            tracker,
            events,
            running: Arc::new(Mutex::new(None)),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receiver for connectivity edges. Subscribe before `start` to see the
    /// initial report.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Starts watching. Calling it while running does nothing.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = mpsc::channel(1);
        let mut reports = self.reachability.subscribe();
        let tracker = Arc::clone(&self.tracker);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let initial = *reports.borrow_and_update();
            apply(&tracker, &events, initial);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = reports.changed() => {
                        if changed.is_err() {
                            debug!("Reachability source closed");
                            break;
                        }
                        let online = *reports.borrow_and_update();
                        apply(&tracker, &events, online);
                    }
                }
            }
            debug!("Connectivity monitor stopped");
        });

        *running = Some(Running { shutdown, handle });
        info!("Connectivity monitor started");
    }

    /// Stops watching and waits for the task to exit. Idempotent.
    pub async fn stop(&self) {
        let running = self.running().take();
        if let Some(Running { shutdown, handle }) = running {
            let _ = shutdown.send(()).await;
            let _ = handle.await;
            info!("Connectivity monitor stopped");
        }
    }
}

fn apply(
    tracker: &SyncStatusTracker,
    events: &broadcast::Sender<ConnectivityEvent>,
    online: bool,
) {
    if !tracker.connectivity_changed(online) {
        return;
    }

    let event = if online {
        ConnectivityEvent::WentOnline
    } else {
        ConnectivityEvent::WentOffline
    };
    info!(?event, "Connectivity changed");
    // No subscribers is fine.
    let _ = events.send(event);
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_edges_only() {
        let reachability = Arc::new(ManualReachability::new(false));
        let tracker = Arc::new(SyncStatusTracker::default());
        let monitor = ConnectivityMonitor::new(reachability.clone(), tracker.clone());
        let mut events = monitor.subscribe();
        monitor.start();

        reachability.set_online(true);
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::WentOnline);
        assert!(tracker.snapshot().is_online);

        reachability.set_online(true);
        reachability.set_online(false);
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::WentOffline);
        assert!(!tracker.snapshot().is_online);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_initial_online_report() {
        let reachability = Arc::new(ManualReachability::new(true));
        let tracker = Arc::new(SyncStatusTracker::default());
        let monitor = ConnectivityMonitor::new(reachability, tracker.clone());
        let mut events = monitor.subscribe();

        monitor.start();
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::WentOnline);
        assert!(tracker.snapshot().is_online);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let monitor = ConnectivityMonitor::new(
            Arc::new(ManualReachability::new(false)),
            Arc::new(SyncStatusTracker::default()),
        );

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
