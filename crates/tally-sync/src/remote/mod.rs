//! # Remote Replica
//!
//! The authoritative remote store, seen through two layers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncOrchestrator                                                       │
//! │       │ reconcile() / settle()                                          │
//! │       ▼                                                                 │
//! │  RemoteReplica (trait) ── BackendReplica                                │
//! │       │   pull pages since cursor ──► ReplicaStore::reconcile_page     │
//! │       │   push dirty pages (minus conflicts)                           │
//! │       │       MarkPushed ──► push ──► MarkSynced                        │
//! │       ▼                                                                 │
//! │  RemoteStorageBackend (trait) ── MemoryRemote, or a real server        │
//! │       connect / pull_since / push / close                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport, auth and wire format live behind `RemoteStorageBackend`.

pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tally_core::{next_tick, ConflictRecord, Record, RecordId, Timestamp};
use tally_db::{BatchOp, WriteBatch};

use crate::error::{SyncError, SyncResult};
use crate::store::ReplicaStore;

pub use memory::MemoryRemote;

// =============================================================================
// Storage Backend
// =============================================================================

/// One page of remote changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullPage {
    /// Records received by the remote after the requested cursor, oldest
    /// first.
    pub records: Vec<Record>,
    /// Cursor to resume from; `None` if the page was empty.
    pub cursor: Option<Timestamp>,
}

/// Remote acknowledgement of a push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReceipt {
    /// Ids the remote stored. Anything missing was refused.
    pub accepted: Vec<RecordId>,
    /// Remote cursor just before this push was stored.
    pub received_after: Option<Timestamp>,
    /// Remote cursor once this push was stored; `None` if the remote does
    /// not report one.
    pub cursor: Option<Timestamp>,
}

impl PushReceipt {
    /// Cursor to resume pulling from, given the cursor the caller had
    /// reached before pushing.
    ///
    /// Only moves forward when nothing else reached the remote between the
    /// caller's last pull and this push, so the skipped range holds nothing
    /// but the pushed records.
    pub fn resume_cursor(&self, pulled_to: Option<Timestamp>) -> Option<Timestamp> {
        match self.cursor {
            Some(cursor) if self.received_after == pulled_to => Some(cursor),
            _ => pulled_to,
        }
    }
}

/// Transport to the authoritative store.
///
/// Cursors are remote-assigned receive times, so a replica never misses a
/// change because of clock skew between devices.
#[async_trait]
pub trait RemoteStorageBackend: Send + Sync + 'static {
    /// Establishes (or verifies) the connection.
    async fn connect(&self) -> SyncResult<()>;

    /// Records received after `cursor`, at most `limit`.
    async fn pull_since(&self, cursor: Option<Timestamp>, limit: u32) -> SyncResult<PullPage>;

    /// Stores `records` on the remote.
    async fn push(&self, records: Vec<Record>) -> SyncResult<PushReceipt>;

    /// Releases the connection.
    async fn close(&self) -> SyncResult<()>;
}

// =============================================================================
// Replica
// =============================================================================

/// Input to one reconcile call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileRequest {
    /// Resume point from the last successful pass.
    pub cursor: Option<Timestamp>,
}

/// What one reconcile call moved.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Remote versions applied locally.
    pub pulled: Vec<RecordId>,
    /// Local versions the remote accepted.
    pub pushed: Vec<RecordId>,
    /// Concurrent modifications, left untouched on both sides.
    pub conflicts: Vec<ConflictRecord>,
    /// Remote records skipped because they failed validation.
    pub rejected: Vec<RecordId>,
    /// Cursor after the last pulled page, or past our own pushes when
    /// nothing else arrived in between.
    pub cursor: Option<Timestamp>,
}

/// A conflict together with the version the resolver picked.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub conflict: ConflictRecord,
    pub record: Record,
}

/// Result of writing resolutions to both replicas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettleOutcome {
    /// Resolutions stored locally.
    pub applied: usize,
    /// Resolutions sent to the remote.
    pub pushed: usize,
    /// Resolutions dropped because the local row moved on meanwhile.
    pub superseded: usize,
}

/// Reconciles the local replica with the remote one.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    /// Pulls remote changes, pushes local ones and reports conflicts.
    ///
    /// Must be safe to repeat after a failure: the orchestrator retries it.
    async fn reconcile(&self, request: ReconcileRequest) -> SyncResult<ReconcileOutcome>;

    /// Writes resolved conflicts to both replicas.
    async fn settle(&self, resolutions: Vec<ResolvedConflict>) -> SyncResult<SettleOutcome>;

    /// Releases the remote connection.
    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// [`RemoteReplica`] over a [`RemoteStorageBackend`], paging in
/// `batch_size` chunks.
pub struct BackendReplica {
    backend: Arc<dyn RemoteStorageBackend>,
    store: ReplicaStore,
    batch_size: u32,
}

impl BackendReplica {
    pub fn new(backend: Arc<dyn RemoteStorageBackend>, store: ReplicaStore, batch_size: u32) -> Self {
        BackendReplica {
            backend,
            store,
            batch_size: batch_size.max(1),
        }
    }

    async fn pull(&self, outcome: &mut ReconcileOutcome) -> SyncResult<HashSet<RecordId>> {
        let mut conflicted = HashSet::new();

        loop {
            let page = self.backend.pull_since(outcome.cursor, self.batch_size).await?;
            let received = page.records.len();
            if received == 0 {
                break;
            }

            // A page that does not move the cursor would be served forever.
            let cursor = match page.cursor {
                Some(cursor) if outcome.cursor.map_or(true, |prev| cursor > prev) => cursor,
                _ => {
                    return Err(SyncError::RemoteRejected(format!(
                        "remote returned {received} record(s) without advancing the cursor"
                    )))
                }
            };

            let applied = self.store.reconcile_page(page.records).await?;
            debug!(
                received,
                applied = applied.applied.len(),
                conflicts = applied.conflicts.len(),
                stale = applied.stale,
                echoed = applied.echoed,
                rejected = applied.rejected.len(),
                "Pulled remote page"
            );
            outcome.pulled.extend(applied.applied);
            outcome.rejected.extend(applied.rejected);
            for conflict in applied.conflicts {
                conflicted.insert(conflict.id.clone());
                outcome.conflicts.push(conflict);
            }

            outcome.cursor = Some(cursor);
            if received < self.batch_size as usize {
                break;
            }
        }

        Ok(conflicted)
    }

    async fn push(
        &self,
        conflicted: &HashSet<RecordId>,
        outcome: &mut ReconcileOutcome,
    ) -> SyncResult<()> {
        let mut after: Option<RecordId> = None;

        loop {
            let page = self.store.dirty_page(after.as_ref(), self.batch_size).await?;
            let full = page.len() == self.batch_size as usize;
            after = match page.last() {
                Some(row) => Some(row.id().clone()),
                None => break,
            };

            // Conflicted rows wait for resolution.
            let records: Vec<Record> = page
                .into_iter()
                .filter(|row| !conflicted.contains(row.id()))
                .map(|row| row.record)
                .collect();

            if !records.is_empty() {
                let mut sending = WriteBatch::new();
                for record in &records {
                    sending.push(BatchOp::MarkPushed {
                        id: record.id.clone(),
                        updated_at: record.updated_at,
                    });
                }
                self.store.commit_sync(sending).await?;

                let receipt = self.backend.push(records.clone()).await?;
                outcome.cursor = receipt.resume_cursor(outcome.cursor);
                let accepted: HashSet<RecordId> = receipt.accepted.into_iter().collect();

                let mut batch = WriteBatch::new();
                let mut refused = Vec::new();
                for record in records {
                    if accepted.contains(&record.id) {
                        batch.push(BatchOp::MarkSynced {
                            id: record.id.clone(),
                            updated_at: record.updated_at,
                        });
                        outcome.pushed.push(record.id);
                    } else {
                        refused.push(record.id.into_inner());
                    }
                }
                self.store.commit_sync(batch).await?;

                if !refused.is_empty() {
                    return Err(SyncError::RemoteRejected(format!(
                        "remote refused {} record(s): {}",
                        refused.len(),
                        refused.join(", ")
                    )));
                }
            }

            if !full {
                break;
            }
        }

        Ok(())
    }
}

/// The version to store on both sides for a resolution.
///
/// Anything other than the remote version is restamped past both
/// conflicting versions so every other replica sees it as a newer change.
fn settled_version(resolution: &ResolvedConflict) -> Record {
    let ResolvedConflict { conflict, record } = resolution;
    if record.same_version(&conflict.remote) {
        return conflict.remote.clone();
    }

    let floor = conflict
        .local
        .updated_at
        .max(conflict.remote.updated_at)
        .max(record.updated_at);
    Record {
        created_at: conflict.local.created_at.min(conflict.remote.created_at),
        updated_at: next_tick(floor),
        ..record.clone()
    }
}

#[async_trait]
impl RemoteReplica for BackendReplica {
    async fn reconcile(&self, request: ReconcileRequest) -> SyncResult<ReconcileOutcome> {
        self.backend.connect().await?;

        let mut outcome = ReconcileOutcome {
            cursor: request.cursor,
            ..Default::default()
        };
        let conflicted = self.pull(&mut outcome).await?;
        self.push(&conflicted, &mut outcome).await?;

        info!(
            pulled = outcome.pulled.len(),
            pushed = outcome.pushed.len(),
            conflicts = outcome.conflicts.len(),
            "Reconciled with remote"
        );
        Ok(outcome)
    }

    async fn settle(&self, resolutions: Vec<ResolvedConflict>) -> SyncResult<SettleOutcome> {
        let versions: Vec<(Record, Timestamp, bool)> = resolutions
            .iter()
            .map(|r| {
                let version = settled_version(r);
                let changed = !version.same_version(&r.conflict.remote);
                (version, r.conflict.local.updated_at, changed)
            })
            .collect();

        let outgoing: Vec<Record> = versions
            .iter()
            .filter(|(_, _, changed)| *changed)
            .map(|(record, _, _)| record.clone())
            .collect();

        let mut outcome = SettleOutcome::default();
        if !outgoing.is_empty() {
            let expected: Vec<RecordId> = outgoing.iter().map(|r| r.id.clone()).collect();
            let receipt = self.backend.push(outgoing).await?;
            let accepted: HashSet<RecordId> = receipt.accepted.into_iter().collect();
            if let Some(missing) = expected.iter().find(|id| !accepted.contains(*id)) {
                return Err(SyncError::RemoteRejected(format!(
                    "remote refused resolution for {missing}"
                )));
            }
            outcome.pushed = expected.len();
        }

        let mut batch = WriteBatch::new();
        for (record, expected_updated_at, _) in versions {
            batch.push(BatchOp::ApplyResolved {
                record,
                expected_updated_at,
            });
        }
        let report = self.store.commit_sync(batch).await?;
        outcome.applied = report.applied;
        outcome.superseded = report.skipped;

        Ok(outcome)
    }

    async fn close(&self) -> SyncResult<()> {
        self.backend.close().await
    }
}

impl std::fmt::Debug for BackendReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendReplica")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
