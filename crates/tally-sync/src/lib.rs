//! # tally-sync: Replication Engine for Tally
//!
//! Keeps a device-local replica and a remote authoritative replica
//! consistent under intermittent connectivity. Local reads and writes never
//! wait on the network.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Agent Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                           SyncAgent                              │  │
//! │  │  Built once per device, owns every component below               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ReplicaStore   │  │ SyncOrchestr-  │  │ RemoteReplica          │    │
//! │  │                │  │ ator           │  │                        │    │
//! │  │ Local reads/   │  │ One pass at a  │  │ Pull since cursor,     │    │
//! │  │ writes, dirty  │  │ time, retry,   │  │ push dirty rows,       │    │
//! │  │ rows, pending  │  │ timeouts,      │  │ settle resolutions     │    │
//! │  │ counter        │  │ conflicts      │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ AutoSync-      │  │ Connectivity-  │  │ SyncStatusTracker      │    │
//! │  │ Scheduler      │  │ Monitor        │  │                        │    │
//! │  │ Interval, re-  │  │ Reachability   │  │ Sole owner of          │    │
//! │  │ connect and    │  │ edges ──►      │  │ SyncStatus, publishes  │    │
//! │  │ write triggers │  │ status + bcast │  │ via watch + emitter    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  STATUS EVENTS (SyncEventEmitter):                                     │
//! │  • emit_status   - every status change                                 │
//! │  • emit_progress - after each completed pass                           │
//! │  • emit_error    - failed passes                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent` and its builder
//! - [`config`] - Sync configuration (device, retry, interval, strategy)
//! - [`connectivity`] - Reachability sources and the connectivity monitor
//! - [`error`] - Sync error types
//! - [`orchestrator`] - Sync passes, retry and conflict resolution
//! - [`remote`] - Remote transport trait, reconcile logic, in-memory remote
//! - [`retry`] - Retry delay schedules
//! - [`scheduler`] - Automatic sync triggers
//! - [`store`] - Local replica reads and writes
//! - [`tracker`] - Status ownership and event emission
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{MemoryRemote, SyncAgent, SyncConfig};
//! use tally_core::Record;
//!
//! let config = SyncConfig::load_or_default(None);
//! let agent = SyncAgent::builder(config)
//!     .with_remote(Arc::new(MemoryRemote::new()))
//!     .build()
//!     .await?;
//! agent.start()?;
//!
//! agent.store().put(Record::new("habit", json!({"name": "Read"}))).await?;
//! println!("Pending: {}", agent.status().pending_changes);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod orchestrator;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod tracker;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{SyncAgent, SyncAgentBuilder};
pub use config::{BackoffKind, DeviceConfig, StorageSettings, SyncConfig, SyncSettings};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ManualReachability, NetworkReachability};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{
    OrchestratorSettings, SkipReason, SyncOptions, SyncOrchestrator, SyncOutcome, SyncReport,
};
pub use remote::{
    BackendReplica, MemoryRemote, PullPage, PushReceipt, ReconcileOutcome, ReconcileRequest,
    RemoteReplica, RemoteStorageBackend, ResolvedConflict, SettleOutcome,
};
pub use retry::{RetryPolicy, RetrySchedule};
pub use scheduler::AutoSyncScheduler;
pub use store::{PageOutcome, ReplicaReader, ReplicaStore, ReplicaTxn};
pub use tracker::{NoOpEmitter, SyncEventEmitter, SyncStatusTracker, SyncTicket};

// =============================================================================
// Logging
// =============================================================================

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
