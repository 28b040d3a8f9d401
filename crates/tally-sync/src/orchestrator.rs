//! # Sync Orchestrator
//!
//! Runs one reconcile pass at a time with retry, timeouts and conflict
//! resolution.
//!
//! ## Pass Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  perform_sync()                                                         │
//! │      │                                                                  │
//! │      ├── tracker.try_begin_sync()                                       │
//! │      │      ├── AlreadyInProgress ──► report, no remote call            │
//! │      │      └── Offline           ──► report Skipped(Offline)           │
//! │      ▼                                                                  │
//! │  ┌── attempt ────────────────────────────────────────────────────┐     │
//! │  │  remote.reconcile(cursor)      (bounded by remote_timeout)    │     │
//! │  │  resolver.resolve_conflict()   per conflict                   │     │
//! │  │  remote.settle(resolved)       (bounded by remote_timeout)    │     │
//! │  └───────────────────────────────────────────────────────────────┘     │
//! │      │                                                                  │
//! │      ├── RemoteUnavailable & attempts left ──► sleep(schedule) ──► ↺    │
//! │      ├── other error / exhausted ──► ticket.fail(), pending unchanged   │
//! │      ▼                                                                  │
//! │  commit checkpoint: pending -= pending_at_start, += unresolved,         │
//! │                     last_sync_at, cursor (held if unresolved)           │
//! │      ▼                                                                  │
//! │  ticket.succeed()                                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{info, info_span, warn, Instrument};

use tally_core::{now, ConflictRecord, ConflictResolver, Record, Resolution, Timestamp};
use tally_db::WriteBatch;

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::remote::{ReconcileOutcome, ReconcileRequest, RemoteReplica, ResolvedConflict, SettleOutcome};
use crate::retry::RetryPolicy;
use crate::store::ReplicaStore;
use crate::tracker::SyncStatusTracker;

// =============================================================================
// Options & Reports
// =============================================================================

/// Retry and timeout behavior of a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Total attempts per pass, first one included.
    pub retry_attempts: u32,
    pub retry_policy: RetryPolicy,
    pub remote_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for OrchestratorSettings {
    fn from(settings: &SyncSettings) -> Self {
        OrchestratorSettings {
            retry_attempts: settings.retry_attempts,
            retry_policy: settings.retry_policy(),
            remote_timeout: settings.remote_timeout(),
        }
    }
}

/// Per-call overrides for [`SyncOrchestrator::force_sync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOptions {
    pub retry_attempts: Option<u32>,
    pub retry_policy: Option<RetryPolicy>,
    pub remote_timeout: Option<Duration>,
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// Another pass held the slot; this call did nothing.
    AlreadyInProgress,
    Skipped(SkipReason),
    Failed,
}

/// Summary of one `perform_sync` call.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub success: bool,
    /// Conflicts settled automatically by the configured strategy.
    pub conflicts_resolved: usize,
    /// Conflicts left for the user (manual strategy).
    pub unresolved: Vec<ConflictRecord>,
    pub pulled: usize,
    pub pushed: usize,
    /// Errors from every failed attempt, when the pass failed.
    pub errors: Vec<SyncError>,
    pub attempts: u32,
    pub duration: Duration,
}

impl SyncReport {
    fn idle(outcome: SyncOutcome) -> Self {
        SyncReport {
            outcome,
            success: false,
            conflicts_resolved: 0,
            unresolved: Vec::new(),
            pulled: 0,
            pushed: 0,
            errors: Vec::new(),
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    fn failed(errors: Vec<SyncError>, attempts: u32, duration: Duration) -> Self {
        SyncReport {
            errors,
            attempts,
            duration,
            ..SyncReport::idle(SyncOutcome::Failed)
        }
    }

    /// The last error of a failed pass.
    pub fn last_error(&self) -> Option<&SyncError> {
        self.errors.last()
    }
}

/// Result of one successful attempt.
struct PassResult {
    reconciled: ReconcileOutcome,
    settled: SettleOutcome,
    resolved: usize,
    unresolved: Vec<ConflictRecord>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates reconcile passes between the local and remote replicas.
pub struct SyncOrchestrator {
    store: ReplicaStore,
    remote: Arc<dyn RemoteReplica>,
    resolver: ConflictResolver,
    tracker: Arc<SyncStatusTracker>,
    settings: OrchestratorSettings,
    unresolved: Mutex<Vec<ConflictRecord>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: ReplicaStore,
        remote: Arc<dyn RemoteReplica>,
        resolver: ConflictResolver,
        settings: OrchestratorSettings,
    ) -> Self {
        let tracker = Arc::clone(store.tracker());
        SyncOrchestrator {
            store,
            remote,
            resolver,
            tracker,
            settings,
            unresolved: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<SyncStatusTracker> {
        &self.tracker
    }

    fn unresolved_lock(&self) -> MutexGuard<'_, Vec<ConflictRecord>> {
        self.unresolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Conflicts from the last pass still waiting for a manual decision.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.unresolved_lock().clone()
    }

    /// Applies the user's choice for a conflict left by the manual strategy.
    ///
    /// The choice is written locally and pushed by the next pass.
    pub async fn resolve_manually(
        &self,
        conflict: &ConflictRecord,
        chosen: Record,
    ) -> SyncResult<Record> {
        let stored = self.store.accept_resolution(conflict, chosen).await?;
        self.unresolved_lock().retain(|c| c.id != conflict.id);
        info!(id = %conflict.id, "Manual conflict resolution accepted");
        Ok(stored)
    }

    /// Runs one pass with the configured retry and timeout settings.
    pub async fn perform_sync(&self) -> SyncReport {
        self.force_sync(SyncOptions::default()).await
    }

    /// Runs one pass with per-call overrides.
    pub async fn force_sync(&self, options: SyncOptions) -> SyncReport {
        let started = Instant::now();

        let ticket = match self.tracker.try_begin_sync() {
            Ok(ticket) => ticket,
            Err(SyncError::AlreadyInProgress) => {
                info!("Sync already in progress, skipping");
                return SyncReport::idle(SyncOutcome::AlreadyInProgress);
            }
            Err(SyncError::Offline) => {
                info!("Device offline, skipping sync");
                return SyncReport::idle(SyncOutcome::Skipped(SkipReason::Offline));
            }
            Err(err) => return SyncReport::failed(vec![err], 0, started.elapsed()),
        };

        let max_attempts = options
            .retry_attempts
            .unwrap_or(self.settings.retry_attempts)
            .max(1);
        let limit = options.remote_timeout.unwrap_or(self.settings.remote_timeout);
        let mut schedule = options
            .retry_policy
            .as_ref()
            .unwrap_or(&self.settings.retry_policy)
            .schedule();

        let checkpoint = match self.store.checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                ticket.fail(&err);
                return SyncReport::failed(vec![err], 0, started.elapsed());
            }
        };

        let mut errors = Vec::new();
        let mut attempts = 0;
        let pass = loop {
            attempts += 1;
            let span = info_span!("sync_pass", attempt = attempts, max_attempts);
            match self.attempt(checkpoint.remote_cursor, limit).instrument(span).await {
                Ok(pass) => break pass,
                Err(err) => {
                    let retry = err.is_retryable()
                        && attempts < max_attempts
                        && self.tracker.snapshot().is_online;
                    warn!(attempt = attempts, error = %err, retry, "Sync attempt failed");
                    errors.push(err);
                    if !retry {
                        if let Some(last) = errors.last() {
                            ticket.fail(last);
                        }
                        return SyncReport::failed(errors, attempts, started.elapsed());
                    }
                    sleep(schedule.next_delay()).await;
                }
            }
        };

        let finished_at = now();
        let unresolved = pass.unresolved.len() as u64;
        if let Err(err) = self
            .commit_checkpoint(
                ticket.pending_at_start(),
                unresolved,
                finished_at,
                &pass,
            )
            .await
        {
            ticket.fail(&err);
            errors.push(err);
            return SyncReport::failed(errors, attempts, started.elapsed());
        }
        ticket.succeed(finished_at, unresolved);
        self.tracker
            .report_progress((pass.reconciled.pushed.len() + pass.reconciled.pulled.len()) as u64);

        *self.unresolved_lock() = pass.unresolved.clone();

        let report = SyncReport {
            outcome: SyncOutcome::Completed,
            success: true,
            conflicts_resolved: pass.resolved,
            unresolved: pass.unresolved,
            pulled: pass.reconciled.pulled.len(),
            pushed: pass.reconciled.pushed.len(),
            errors: Vec::new(),
            attempts,
            duration: started.elapsed(),
        };
        info!(
            pulled = report.pulled,
            pushed = report.pushed,
            resolved = report.conflicts_resolved,
            superseded = pass.settled.superseded,
            unresolved = report.unresolved.len(),
            attempts,
            "Sync pass completed"
        );
        report
    }

    async fn attempt(&self, cursor: Option<Timestamp>, limit: Duration) -> SyncResult<PassResult> {
        let reconciled = bounded(limit, self.remote.reconcile(ReconcileRequest { cursor })).await?;

        let mut resolutions = Vec::new();
        let mut unresolved = Vec::new();
        for conflict in &reconciled.conflicts {
            match self.resolver.resolve_conflict(conflict) {
                Resolution::Resolved(record) => resolutions.push(ResolvedConflict {
                    conflict: conflict.clone(),
                    record,
                }),
                Resolution::NeedsManualResolution(pending) => {
                    warn!(id = %pending.id, "Conflict needs manual resolution");
                    unresolved.push(pending);
                }
            }
        }

        let resolved = resolutions.len();
        let settled = if resolutions.is_empty() {
            SettleOutcome::default()
        } else {
            bounded(limit, self.remote.settle(resolutions)).await?
        };

        Ok(PassResult {
            reconciled,
            settled,
            resolved,
            unresolved,
        })
    }

    /// Persists the pass outcome in one local commit.
    ///
    /// While conflicts wait for the user the old cursor is kept, so the next
    /// pass pulls those remote versions again.
    async fn commit_checkpoint(
        &self,
        pending_at_start: u64,
        unresolved: u64,
        finished_at: Timestamp,
        pass: &PassResult,
    ) -> SyncResult<()> {
        let mut batch = WriteBatch::new().pending_delta(unresolved as i64 - pending_at_start as i64);
        batch.last_sync_at = Some(finished_at);
        if unresolved == 0 {
            batch.remote_cursor = pass.reconciled.cursor;
        }
        self.store.commit_sync(batch).await?;
        Ok(())
    }

    pub(crate) async fn close(&self) -> SyncResult<()> {
        self.remote.close().await
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("strategy", self.resolver.strategy())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Bounds a remote call. An elapsed timeout is a transient failure.
async fn bounded<T>(limit: Duration, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::RemoteUnavailable(format!(
            "remote call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{BackendReplica, MemoryRemote};
    use async_trait::async_trait;
    use serde_json::json;
    use tally_core::ConflictStrategy;
    use tally_db::MemoryBackend;

    fn orchestrator(
        strategy: ConflictStrategy,
        settings: OrchestratorSettings,
    ) -> (SyncOrchestrator, ReplicaStore, MemoryRemote) {
        let tracker = Arc::new(SyncStatusTracker::default());
        tracker.connectivity_changed(true);
        let (store, _) = ReplicaStore::new(Arc::new(MemoryBackend::new()), tracker);
        let remote = MemoryRemote::new();
        let replica = Arc::new(BackendReplica::new(Arc::new(remote.clone()), store.clone(), 50));
        let orchestrator =
            SyncOrchestrator::new(store.clone(), replica, ConflictResolver::new(strategy), settings);
        (orchestrator, store, remote)
    }

    fn fast_retries(attempts: u32) -> OrchestratorSettings {
        OrchestratorSettings {
            retry_attempts: attempts,
            retry_policy: RetryPolicy::Fixed {
                delay: Duration::from_millis(10),
            },
            remote_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_sync_clears_pending() {
        let (orchestrator, store, remote) =
            orchestrator(ConflictStrategy::RemoteWins, fast_retries(3));
        for n in 0..3 {
            store.put(Record::new("entry", json!({"n": n}))).await.unwrap();
        }

        let report = orchestrator.perform_sync().await;

        assert!(report.success);
        assert_eq!(report.pushed, 3);
        assert_eq!(report.attempts, 1);
        assert_eq!(remote.len(), 3);
        assert_eq!(store.pending_changes(), 0);
        let checkpoint = store.checkpoint().await.unwrap();
        assert_eq!(checkpoint.pending_changes, 0);
        assert!(checkpoint.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_offline_is_skipped() {
        let (orchestrator, store, remote) =
            orchestrator(ConflictStrategy::RemoteWins, fast_retries(3));
        store.tracker().connectivity_changed(false);

        let report = orchestrator.perform_sync().await;

        assert_eq!(report.outcome, SyncOutcome::Skipped(SkipReason::Offline));
        assert_eq!(remote.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let (orchestrator, store, remote) =
            orchestrator(ConflictStrategy::RemoteWins, fast_retries(3));
        store.put(Record::new("entry", json!({}))).await.unwrap();
        remote.fail_next_with(SyncError::RemoteUnavailable("blip".into()));

        let report = orchestrator.perform_sync().await;

        assert!(report.success);
        assert_eq!(report.attempts, 2);
        assert!(report.errors.is_empty());
        assert_eq!(store.pending_changes(), 0);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (orchestrator, store, remote) =
            orchestrator(ConflictStrategy::RemoteWins, fast_retries(3));
        store.put(Record::new("entry", json!({}))).await.unwrap();
        remote.reject_next_push("quota exceeded");

        let report = orchestrator.perform_sync().await;

        assert!(!report.success);
        assert_eq!(report.attempts, 1);
        assert!(matches!(
            report.last_error(),
            Some(SyncError::RemoteRejected(_))
        ));
        assert_eq!(store.pending_changes(), 1);
        assert!(!store.tracker().snapshot().is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_unavailable() {
        struct Hanging;

        #[async_trait]
        impl RemoteReplica for Hanging {
            async fn reconcile(&self, _request: ReconcileRequest) -> SyncResult<ReconcileOutcome> {
                std::future::pending().await
            }
            async fn settle(&self, _r: Vec<ResolvedConflict>) -> SyncResult<SettleOutcome> {
                Ok(SettleOutcome::default())
            }
        }

        let tracker = Arc::new(SyncStatusTracker::default());
        tracker.connectivity_changed(true);
        let (store, _) = ReplicaStore::new(Arc::new(MemoryBackend::new()), tracker);
        let orchestrator = SyncOrchestrator::new(
            store,
            Arc::new(Hanging),
            ConflictResolver::new(ConflictStrategy::RemoteWins),
            OrchestratorSettings {
                retry_attempts: 2,
                retry_policy: RetryPolicy::Fixed {
                    delay: Duration::from_millis(100),
                },
                remote_timeout: Duration::from_millis(500),
            },
        );

        let report = orchestrator.perform_sync().await;

        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert!(report.errors.iter().all(SyncError::is_retryable));
        assert!(report.duration >= Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_force_sync_overrides_attempts() {
        let (orchestrator, _, remote) = orchestrator(ConflictStrategy::RemoteWins, fast_retries(5));
        remote.set_reachable(false);

        let report = orchestrator
            .force_sync(SyncOptions {
                retry_attempts: Some(1),
                ..Default::default()
            })
            .await;

        assert_eq!(report.attempts, 1);
        assert_eq!(remote.connect_count(), 1);
    }
}
