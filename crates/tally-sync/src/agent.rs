//! # Sync Agent
//!
//! Wires the replica store, orchestrator, connectivity monitor and scheduler
//! into one handle owned by the host application.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncAgentBuilder::new(config)                                          │
//! │      .with_local(..)  .with_remote(..)  .with_reachability(..)          │
//! │      .build().await                                                     │
//! │          │  validate config, open local store, restore checkpoint       │
//! │          ▼                                                              │
//! │  SyncAgent ── store() ──► reads/writes work immediately, even offline   │
//! │      │                                                                  │
//! │      ├── start()      scheduler + connectivity monitor                  │
//! │      ├── perform_sync() / force_sync()   manual passes                  │
//! │      └── shutdown()   stop tasks, close remote, close local             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use tally_core::{
    ConflictRecord, ConflictResolver, ConflictStrategy, MergeFn, Record, SyncStatus,
};
use tally_db::{Database, DbConfig, LocalStorageBackend};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ManualReachability, NetworkReachability};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{OrchestratorSettings, SyncOptions, SyncOrchestrator, SyncReport};
use crate::remote::{BackendReplica, RemoteReplica, RemoteStorageBackend};
use crate::scheduler::AutoSyncScheduler;
use crate::store::ReplicaStore;
use crate::tracker::{NoOpEmitter, SyncEventEmitter, SyncStatusTracker};

// =============================================================================
// Sync Agent
// =============================================================================

/// Running replication engine for one device.
pub struct SyncAgent {
    config: SyncConfig,
    store: ReplicaStore,
    tracker: Arc<SyncStatusTracker>,
    orchestrator: Arc<SyncOrchestrator>,
    monitor: ConnectivityMonitor,
    scheduler: AutoSyncScheduler,
    closed: AtomicBool,
}

impl SyncAgent {
    /// Shorthand for [`SyncAgentBuilder::new`].
    pub fn builder(config: SyncConfig) -> SyncAgentBuilder {
        SyncAgentBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local replica. Usable whether or not the agent is started.
    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.tracker.snapshot()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tracker.subscribe()
    }

    /// Starts background syncing. Idempotent.
    ///
    /// The scheduler subscribes to connectivity events before the monitor
    /// publishes its first report.
    pub fn start(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }

        self.scheduler.start();
        self.monitor.start();
        info!(device_id = %self.config.device_id(), "Sync agent started");
        Ok(())
    }

    /// Runs one sync pass now.
    pub async fn perform_sync(&self) -> SyncReport {
        self.orchestrator.perform_sync().await
    }

    /// Runs one sync pass now with per-call overrides.
    pub async fn force_sync(&self, options: SyncOptions) -> SyncReport {
        self.orchestrator.force_sync(options).await
    }

    /// Conflicts waiting for a manual decision.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.orchestrator.unresolved_conflicts()
    }

    /// Stores the user's choice for a manual conflict.
    pub async fn resolve_conflict(
        &self,
        conflict: &ConflictRecord,
        chosen: Record,
    ) -> SyncResult<Record> {
        self.orchestrator.resolve_manually(conflict, chosen).await
    }

    /// Stops background tasks and releases both replicas. Idempotent.
    ///
    /// A pass already running is allowed to finish first.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down sync agent");
        self.monitor.stop().await;
        self.scheduler.stop().await;

        if let Err(e) = self.orchestrator.close().await {
            warn!(error = %e, "Failed to close remote replica");
        }
        self.store.close().await?;

        info!("Sync agent shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for SyncAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAgent")
            .field("device_id", &self.config.device_id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a [`SyncAgent`].
pub struct SyncAgentBuilder {
    config: SyncConfig,
    local: Option<Arc<dyn LocalStorageBackend>>,
    remote: Option<Arc<dyn RemoteStorageBackend>>,
    replica: Option<Arc<dyn RemoteReplica>>,
    reachability: Option<Arc<dyn NetworkReachability>>,
    merge: Option<MergeFn>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncAgentBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            local: None,
            remote: None,
            replica: None,
            reachability: None,
            merge: None,
            emitter: None,
        }
    }

    /// Sets the local backend. Defaults to SQLite at the configured path.
    pub fn with_local(mut self, local: Arc<dyn LocalStorageBackend>) -> Self {
        self.local = Some(local);
        self
    }

    /// Sets the remote transport.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStorageBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replaces the whole remote reconcile logic. Takes precedence over
    /// `with_remote`.
    pub fn with_replica(mut self, replica: Arc<dyn RemoteReplica>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Sets the reachability source. Without one the device is assumed
    /// online once started.
    pub fn with_reachability(mut self, reachability: Arc<dyn NetworkReachability>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    /// Sets the merge function. Required when the policy is `merge`.
    pub fn with_merge(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the agent. Does not start background tasks.
    pub async fn build(self) -> SyncResult<SyncAgent> {
        self.config.validate()?;

        let strategy = ConflictStrategy::from_policy(self.config.conflict_policy(), self.merge)?;

        let local = match self.local {
            Some(local) => local,
            None => open_database(&self.config).await?,
        };
        local.open().await.map_err(SyncError::local_write)?;

        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let tracker = Arc::new(SyncStatusTracker::new(emitter));
        tracker.restore(&local.checkpoint().await?);

        let (store, signals) = ReplicaStore::new(local, Arc::clone(&tracker));

        let replica: Arc<dyn RemoteReplica> = match (self.replica, self.remote) {
            (Some(replica), _) => replica,
            (None, Some(remote)) => Arc::new(BackendReplica::new(
                remote,
                store.clone(),
                self.config.sync.batch_size,
            )),
            (None, None) => {
                return Err(SyncError::InvalidConfig("Remote backend required".into()))
            }
        };

        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            replica,
            ConflictResolver::new(strategy),
            OrchestratorSettings::from(&self.config.sync),
        ));

        let reachability = self
            .reachability
            .unwrap_or_else(|| Arc::new(ManualReachability::new(true)));
        let monitor = ConnectivityMonitor::new(reachability, Arc::clone(&tracker));
        let scheduler = AutoSyncScheduler::new(
            Arc::clone(&orchestrator),
            monitor.clone(),
            self.config.sync.sync_interval(),
            Some(signals),
        );

        info!(
            device_id = %self.config.device_id(),
            strategy = %self.config.conflict_policy(),
            pending = tracker.snapshot().pending_changes,
            "Sync agent built"
        );

        Ok(SyncAgent {
            config: self.config,
            store,
            tracker,
            orchestrator,
            monitor,
            scheduler,
            closed: AtomicBool::new(false),
        })
    }
}

async fn open_database(config: &SyncConfig) -> SyncResult<Arc<dyn LocalStorageBackend>> {
    let path = config
        .database_path()
        .ok_or_else(|| SyncError::InvalidConfig("No database path available".into()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SyncError::LocalWriteFailed(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let db = Database::new(DbConfig::new(path))
        .await
        .map_err(SyncError::local_write)?;
    Ok(Arc::new(db))
}
