//! # Sync Status Tracker
//!
//! Single owner of the observable sync status.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Status Ownership                                 │
//! │                                                                         │
//! │  ConnectivityMonitor ──► connectivity_changed() ─┐                      │
//! │  SyncOrchestrator    ──► try_begin_sync()        │                      │
//! │                          SyncTicket::succeed()   ├──► Mutex<Inner>      │
//! │                          SyncTicket::fail()      │        │             │
//! │  ReplicaStore        ──► record_local_changes() ─┘        │             │
//! │                                                           ▼             │
//! │                                  watch::Sender<SyncStatus> + emitter    │
//! │                                                                         │
//! │  The in-flight flag and the pending counter change only here, under    │
//! │  one lock, so "at most one pass at a time" is a compare-and-set.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, warn};

use tally_core::{StatusEvent, SyncState, SyncStatus, Timestamp};
use tally_db::Checkpoint;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Event Emitter
// =============================================================================

/// Callback sink for status changes (UI bindings, metrics, logs).
///
/// Called after the tracker lock is released; implementations must not
/// block.
pub trait SyncEventEmitter: Send + Sync {
    /// A new status snapshot was published.
    fn emit_status(&self, status: &SyncStatus);

    /// A sync pass finished: `pending` changes remain, `synced` records moved.
    fn emit_progress(&self, pending: u64, synced: u64);

    /// A sync pass failed.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// Emitter that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: u64, _synced: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug)]
struct Inner {
    state: SyncState,
    in_flight: bool,
    last_sync_at: Option<Timestamp>,
    pending: u64,
    last_error: Option<String>,
}

impl Inner {
    fn snapshot(&self) -> SyncStatus {
        SyncStatus {
            state: self.state,
            is_online: self.state.is_online(),
            is_syncing: self.in_flight,
            last_sync_at: self.last_sync_at,
            pending_changes: self.pending,
            last_error: self.last_error.clone(),
        }
    }

    /// Applies an event, keeping the current state on an invalid transition.
    fn apply(&mut self, event: StatusEvent) {
        match self.state.on_event(event) {
            Ok(next) => self.state = next,
            Err(e) => warn!(error = %e, "Ignoring invalid status transition"),
        }
    }
}

/// Owns `SyncStatus` and publishes every change.
pub struct SyncStatusTracker {
    inner: Mutex<Inner>,
    tx: watch::Sender<SyncStatus>,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl SyncStatusTracker {
    pub fn new(emitter: Arc<dyn SyncEventEmitter>) -> Self {
        let inner = Inner {
            state: SyncState::initial(),
            in_flight: false,
            last_sync_at: None,
            pending: 0,
            last_error: None,
        };
        let (tx, _) = watch::channel(inner.snapshot());

        SyncStatusTracker {
            inner: Mutex::new(inner),
            tx,
            emitter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded state is plain data; a panic elsewhere cannot leave it
        // half-updated across an await.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, status: SyncStatus) {
        self.tx.send_replace(status.clone());
        self.emitter.emit_status(&status);
    }

    /// Current status snapshot.
    pub fn snapshot(&self) -> SyncStatus {
        self.lock().snapshot()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Seeds pending count and last sync time from the persisted checkpoint.
    pub fn restore(&self, checkpoint: &Checkpoint) {
        let status = {
            let mut inner = self.lock();
            inner.pending = checkpoint.pending_changes;
            inner.last_sync_at = checkpoint.last_sync_at;
            inner.snapshot()
        };
        debug!(pending = status.pending_changes, "Restored sync status from checkpoint");
        self.publish(status);
    }

    /// Applies a reachability change. Returns true if the state changed.
    pub fn connectivity_changed(&self, online: bool) -> bool {
        let event = if online {
            StatusEvent::ConnectivityRegained
        } else {
            StatusEvent::ConnectivityLost
        };

        let status = {
            let mut inner = self.lock();
            let before = inner.state;
            inner.apply(event);
            if inner.state == before {
                return false;
            }
            inner.snapshot()
        };
        self.publish(status);
        true
    }

    /// Claims the single sync slot.
    ///
    /// # Errors
    /// - `AlreadyInProgress` if a pass is running
    /// - `Offline` if the device has no connectivity
    pub fn try_begin_sync(self: &Arc<Self>) -> SyncResult<SyncTicket> {
        let (status, pending_at_start) = {
            let mut inner = self.lock();
            if inner.in_flight {
                return Err(SyncError::AlreadyInProgress);
            }
            if !inner.state.is_online() {
                return Err(SyncError::Offline);
            }
            inner.apply(StatusEvent::SyncTriggered);
            inner.in_flight = true;
            (inner.snapshot(), inner.pending)
        };
        self.publish(status);

        Ok(SyncTicket {
            tracker: Arc::clone(self),
            pending_at_start,
            finished: false,
        })
    }

    /// Counts `count` committed local changes.
    pub fn record_local_changes(&self, count: u64) {
        if count == 0 {
            return;
        }
        let status = {
            let mut inner = self.lock();
            inner.pending = inner.pending.saturating_add(count);
            inner.snapshot()
        };
        self.publish(status);
    }

    /// Reports how far the last pass got.
    pub fn report_progress(&self, synced: u64) {
        let pending = self.lock().pending;
        self.emitter.emit_progress(pending, synced);
    }

    fn finish(&self, outcome: Result<(Timestamp, u64, u64), &SyncError>) {
        let status = {
            let mut inner = self.lock();
            match outcome {
                Ok((finished_at, pending_at_start, unresolved)) => {
                    // Changes committed while the pass ran stay counted.
                    inner.pending = inner
                        .pending
                        .saturating_sub(pending_at_start)
                        .saturating_add(unresolved);
                    inner.last_sync_at = Some(finished_at);
                    inner.last_error = None;
                    inner.apply(StatusEvent::SyncSucceeded);
                }
                Err(err) => {
                    inner.last_error = Some(err.to_string());
                    inner.apply(StatusEvent::SyncFailed);
                }
            }
            inner.in_flight = false;
            inner.snapshot()
        };

        if let Err(err) = outcome {
            self.emitter.emit_error(&err.to_string(), err.is_retryable());
        }
        self.publish(status);
    }
}

impl Default for SyncStatusTracker {
    fn default() -> Self {
        SyncStatusTracker::new(Arc::new(NoOpEmitter))
    }
}

impl std::fmt::Debug for SyncStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStatusTracker")
            .field("status", &self.snapshot())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Sync Ticket
// =============================================================================

/// Proof that the holder owns the running sync pass.
///
/// Dropping an unfinished ticket marks the pass failed, so a cancelled or
/// panicking pass never leaves `is_syncing` stuck.
#[derive(Debug)]
pub struct SyncTicket {
    tracker: Arc<SyncStatusTracker>,
    pending_at_start: u64,
    finished: bool,
}

impl SyncTicket {
    /// Pending count observed when the pass began.
    pub fn pending_at_start(&self) -> u64 {
        self.pending_at_start
    }

    /// Ends the pass successfully. `unresolved` conflicts stay pending.
    pub fn succeed(mut self, finished_at: Timestamp, unresolved: u64) {
        self.finished = true;
        self.tracker
            .finish(Ok((finished_at, self.pending_at_start, unresolved)));
    }

    /// Ends the pass with an error.
    pub fn fail(mut self, err: &SyncError) {
        self.finished = true;
        self.tracker.finish(Err(err));
    }
}

impl Drop for SyncTicket {
    fn drop(&mut self) {
        if !self.finished {
            let err = SyncError::Internal("sync pass ended without completing".into());
            self.tracker.finish(Err(&err));
        }
    }
}
