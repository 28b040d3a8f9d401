//! # Sync Status State Machine
//!
//! Pure, side-effect-free transitions between `Idle`, `Syncing` and
//! `Offline`. The tracker in tally-sync owns the mutable copy and feeds it
//! events; this module only decides what the next state is.
//!
//! ## Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │            connectivity lost                                            │
//! │   ┌──────┐ ─────────────────────────────► ┌─────────┐                   │
//! │   │ Idle │                                │ Offline │                   │
//! │   └──────┘ ◄───────────────────────────── └─────────┘                   │
//! │    │  ▲        connectivity regained           ▲                        │
//! │    │  │                                        │                        │
//! │    │  │ sync success / sync failure            │ connectivity lost      │
//! │    │  │ (retries exhausted)                    │ mid-sync               │
//! │    ▼  │                                        │                        │
//! │  ┌─────────┐ ──────────────────────────────────┘                        │
//! │  │ Syncing │                                                            │
//! │  └─────────┘   sync triggered only from Idle                            │
//! │                                                                         │
//! │  Offline never goes directly to Syncing.                               │
//! │  A pass that finishes after connectivity was lost reports its result   │
//! │  without moving the state out of Offline (or Idle, if regained).       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::types::Timestamp;

// =============================================================================
// State
// =============================================================================

/// Replication state as seen by status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Online, no reconcile running.
    Idle,
    /// A reconcile pass is in flight.
    Syncing,
    /// No network reachability.
    Offline,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Offline => write!(f, "offline"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    ConnectivityLost,
    ConnectivityRegained,
    SyncTriggered,
    SyncSucceeded,
    SyncFailed,
}

impl SyncState {
    /// Initial state at process start: nothing is known about the network.
    pub fn initial() -> Self {
        SyncState::Offline
    }

    /// Applies an event, returning the next state.
    ///
    /// Repeated connectivity reports are no-ops, and completion events that
    /// arrive after the state already left `Syncing` keep the current state.
    pub fn on_event(self, event: StatusEvent) -> Result<SyncState, CoreError> {
        use StatusEvent::*;
        use SyncState::*;

        match (self, event) {
            (Idle, ConnectivityLost) => Ok(Offline),
            (Offline, ConnectivityRegained) => Ok(Idle),
            (Idle, SyncTriggered) => Ok(Syncing),
            (Syncing, SyncSucceeded) | (Syncing, SyncFailed) => Ok(Idle),
            (Syncing, ConnectivityLost) => Ok(Offline),

            (Idle, ConnectivityRegained) | (Offline, ConnectivityLost) => Ok(self),
            (Syncing, ConnectivityRegained) => Ok(Syncing),
            (Idle, SyncSucceeded | SyncFailed) | (Offline, SyncSucceeded | SyncFailed) => Ok(self),

            (Offline, SyncTriggered) | (Syncing, SyncTriggered) => {
                Err(CoreError::InvalidTransition { from: self, event })
            }
        }
    }

    /// True when the device is believed reachable.
    pub fn is_online(&self) -> bool {
        !matches!(self, SyncState::Offline)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of replication status.
///
/// Consumed by connection/status indicators; never mutated by them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current state machine state.
    pub state: SyncState,

    /// Whether the network is reachable.
    pub is_online: bool,

    /// Whether a reconcile pass is in flight.
    pub is_syncing: bool,

    /// Completion time of the last successful pass.
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<Timestamp>,

    /// Local changes not yet confirmed on the remote replica.
    pub pending_changes: u64,

    /// Message of the last failed pass, cleared by the next success.
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            state: SyncState::initial(),
            is_online: false,
            is_syncing: false,
            last_sync_at: None,
            pending_changes: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status() {
        let status = SyncStatus::default();
        assert_eq!(status.state, SyncState::Offline);
        assert!(!status.is_online);
        assert!(!status.is_syncing);
        assert_eq!(status.pending_changes, 0);
        assert!(status.last_sync_at.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let state = SyncState::initial()
            .on_event(StatusEvent::ConnectivityRegained)
            .unwrap();
        assert_eq!(state, SyncState::Idle);

        let state = state.on_event(StatusEvent::SyncTriggered).unwrap();
        assert_eq!(state, SyncState::Syncing);

        let state = state.on_event(StatusEvent::SyncSucceeded).unwrap();
        assert_eq!(state, SyncState::Idle);

        let state = state.on_event(StatusEvent::SyncTriggered).unwrap();
        let state = state.on_event(StatusEvent::SyncFailed).unwrap();
        assert_eq!(state, SyncState::Idle);
    }

    #[test]
    fn test_offline_cannot_start_sync() {
        let err = SyncState::Offline
            .on_event(StatusEvent::SyncTriggered)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidTransition {
                from: SyncState::Offline,
                event: StatusEvent::SyncTriggered
            }
        );
    }

    #[test]
    fn test_syncing_rejects_second_trigger() {
        assert!(SyncState::Syncing
            .on_event(StatusEvent::SyncTriggered)
            .is_err());
    }

    #[test]
    fn test_connectivity_lost_mid_sync() {
        let state = SyncState::Syncing
            .on_event(StatusEvent::ConnectivityLost)
            .unwrap();
        assert_eq!(state, SyncState::Offline);

        // The in-flight pass finishing later does not leave Offline.
        let state = state.on_event(StatusEvent::SyncSucceeded).unwrap();
        assert_eq!(state, SyncState::Offline);
    }

    #[test]
    fn test_repeated_connectivity_reports_are_noops() {
        assert_eq!(
            SyncState::Idle
                .on_event(StatusEvent::ConnectivityRegained)
                .unwrap(),
            SyncState::Idle
        );
        assert_eq!(
            SyncState::Offline
                .on_event(StatusEvent::ConnectivityLost)
                .unwrap(),
            SyncState::Offline
        );
    }
}
