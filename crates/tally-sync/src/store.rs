//! # Replica Store
//!
//! Device-local reads and writes, always available regardless of
//! connectivity.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  write(fn) / transaction(fn) / batch_write(ops)                         │
//! │      │                                                                  │
//! │      ▼  (write lock: one local commit at a time)                        │
//! │  ReplicaTxn ── put/delete stage rows in memory, stamped + validated     │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  LocalStorageBackend::commit(WriteBatch { rows, pending_delta })        │
//! │      │           rows and the pending counter land in ONE commit        │
//! │      ├── Err ──► LocalWriteFailed, nothing applied, counter unchanged   │
//! │      ▼                                                                  │
//! │  tracker.record_local_changes(n) ──► signal scheduler (if online)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads never take the write lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};

use tally_core::conflict::is_conflict;
use tally_core::validation::validate_record;
use tally_core::{next_tick, now, ConflictRecord, Record, RecordId, RecordOp};
use tally_db::{BatchOp, Checkpoint, CommitReport, LocalStorageBackend, StoredRecord, WriteBatch};

use crate::error::{SyncError, SyncResult};
use crate::tracker::SyncStatusTracker;

// =============================================================================
// Reader
// =============================================================================

/// Read-only view handed to [`ReplicaStore::read`].
pub struct ReplicaReader {
    backend: Arc<dyn LocalStorageBackend>,
}

impl ReplicaReader {
    /// Fetches a live record.
    pub async fn get(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self
            .backend
            .get(id)
            .await?
            .map(|row| row.record)
            .filter(|record| !record.deleted))
    }

    /// Lists live records, optionally for one collection.
    pub async fn list(&self, collection: Option<&str>) -> SyncResult<Vec<Record>> {
        Ok(self.backend.list(collection).await?)
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Staging area for one local transaction.
///
/// Nothing touches storage until the enclosing `write`/`transaction` call
/// commits; an error from the closure discards every staged row.
pub struct ReplicaTxn {
    backend: Arc<dyn LocalStorageBackend>,
    staged: BTreeMap<RecordId, StoredRecord>,
}

impl ReplicaTxn {
    fn new(backend: Arc<dyn LocalStorageBackend>) -> Self {
        ReplicaTxn {
            backend,
            staged: BTreeMap::new(),
        }
    }

    async fn prior(&self, id: &RecordId) -> SyncResult<Option<StoredRecord>> {
        match self.staged.get(id) {
            Some(row) => Ok(Some(row.clone())),
            None => Ok(self.backend.get(id).await?),
        }
    }

    /// Reads a live record, seeing this transaction's own staged writes.
    pub async fn get(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self
            .prior(id)
            .await?
            .map(|row| row.record)
            .filter(|record| !record.deleted))
    }

    /// Stages an insert or replace. Returns the record as it will be stored.
    ///
    /// `created_at` of an existing record is kept and `updated_at` always
    /// moves forward past the previous version.
    pub async fn put(&mut self, mut record: Record) -> SyncResult<Record> {
        let prior = self.prior(&record.id).await?;
        let stamp = now();

        let base = match &prior {
            Some(row) => {
                record.created_at = row.record.created_at;
                record.updated_at = stamp.max(next_tick(row.record.updated_at));
                row.base_updated_at
            }
            None => {
                record.updated_at = stamp.max(record.created_at);
                None
            }
        };

        validate_record(&record)?;
        self.staged
            .insert(record.id.clone(), StoredRecord::local(record.clone(), base));
        Ok(record)
    }

    /// Stages a tombstone. Returns false if there was nothing live to delete.
    pub async fn delete(&mut self, id: &RecordId) -> SyncResult<bool> {
        let row = match self.prior(id).await? {
            Some(row) if !row.record.deleted => row,
            _ => return Ok(false),
        };

        let at = now().max(next_tick(row.record.updated_at));
        let tombstone = row.record.tombstone(at);
        self.staged
            .insert(id.clone(), StoredRecord::local(tombstone, row.base_updated_at));
        Ok(true)
    }

    /// Number of distinct records staged so far.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn into_batch(self, pending_delta: u64) -> WriteBatch {
        let mut batch = WriteBatch::new().pending_delta(pending_delta as i64);
        for row in self.staged.into_values() {
            batch.push(BatchOp::Upsert(row));
        }
        batch
    }
}

fn apply_ops(txn: &mut ReplicaTxn, ops: Vec<RecordOp>) -> BoxFuture<'_, SyncResult<()>> {
    Box::pin(async move {
        for op in ops {
            match op {
                RecordOp::Put(record) => {
                    txn.put(record).await?;
                }
                RecordOp::Delete(id) => {
                    txn.delete(&id).await?;
                }
            }
        }
        Ok(())
    })
}

// =============================================================================
// Pull Classification
// =============================================================================

/// What happened to one page of pulled records.
#[derive(Debug, Default)]
pub struct PageOutcome {
    /// Ids whose remote version was applied locally.
    pub applied: Vec<RecordId>,
    /// Ids modified concurrently on both sides.
    pub conflicts: Vec<ConflictRecord>,
    /// Remote versions older than an unpushed local edit; the local edit
    /// wins by being pushed next.
    pub stale: usize,
    /// Versions this device pushed without seeing the acknowledgement. The
    /// base moves to them and the newer local edit stays queued.
    pub echoed: usize,
    /// Ids of remote records that failed validation and were skipped.
    pub rejected: Vec<RecordId>,
}

// =============================================================================
// Store
// =============================================================================

/// The device-local replica.
///
/// Cheap to clone; clones share the backend, the write lock and the status
/// tracker.
#[derive(Clone)]
pub struct ReplicaStore {
    backend: Arc<dyn LocalStorageBackend>,
    tracker: Arc<SyncStatusTracker>,
    write_lock: Arc<Mutex<()>>,
    signal: mpsc::Sender<()>,
}

impl ReplicaStore {
    /// Creates the store and the receiving end of its write signal.
    ///
    /// The signal carries at most one queued wake-up; extra writes while one
    /// is queued are coalesced.
    pub fn new(
        backend: Arc<dyn LocalStorageBackend>,
        tracker: Arc<SyncStatusTracker>,
    ) -> (Self, mpsc::Receiver<()>) {
        let (signal, signals) = mpsc::channel(1);
        let store = ReplicaStore {
            backend,
            tracker,
            write_lock: Arc::new(Mutex::new(())),
            signal,
        };
        (store, signals)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Runs `f` against a read-only view.
    pub async fn read<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: for<'r> FnOnce(&'r ReplicaReader) -> BoxFuture<'r, SyncResult<T>>,
    {
        let reader = ReplicaReader {
            backend: Arc::clone(&self.backend),
        };
        f(&reader).await
    }

    /// Fetches a live record.
    pub async fn get(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        ReplicaReader {
            backend: Arc::clone(&self.backend),
        }
        .get(id)
        .await
    }

    /// Lists live records, optionally for one collection.
    pub async fn list(&self, collection: Option<&str>) -> SyncResult<Vec<Record>> {
        Ok(self.backend.list(collection).await?)
    }

    /// Local changes not yet confirmed by the remote.
    pub fn pending_changes(&self) -> u64 {
        self.tracker.snapshot().pending_changes
    }

    /// Persisted sync checkpoint.
    pub async fn checkpoint(&self) -> SyncResult<Checkpoint> {
        Ok(self.backend.checkpoint().await?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Runs `f` as one local write. Counts as a single pending change if it
    /// staged anything.
    pub async fn write<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut ReplicaTxn) -> BoxFuture<'t, SyncResult<T>> + Send,
    {
        self.run_local(f, |_| 1).await
    }

    /// Runs `f` atomically. Every record it stages counts as a pending
    /// change; any error rolls back the whole transaction.
    pub async fn transaction<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut ReplicaTxn) -> BoxFuture<'t, SyncResult<T>> + Send,
    {
        self.run_local(f, |staged| staged as u64).await
    }

    /// Applies `ops` atomically, counting one pending change per operation.
    pub async fn batch_write(&self, ops: Vec<RecordOp>) -> SyncResult<()> {
        let count = ops.len() as u64;
        self.run_local(move |txn| apply_ops(txn, ops), move |_| count)
            .await
    }

    /// Inserts or replaces one record.
    pub async fn put(&self, record: Record) -> SyncResult<Record> {
        self.write(move |txn| Box::pin(async move { txn.put(record).await }))
            .await
    }

    /// Deletes one record. Returns false if it did not exist.
    pub async fn delete(&self, id: &RecordId) -> SyncResult<bool> {
        let id = id.clone();
        self.write(move |txn| Box::pin(async move { txn.delete(&id).await }))
            .await
    }

    #[instrument(skip_all)]
    async fn run_local<T, F, C>(&self, f: F, count: C) -> SyncResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut ReplicaTxn) -> BoxFuture<'t, SyncResult<T>> + Send,
        C: FnOnce(usize) -> u64 + Send,
    {
        let guard = self.write_lock.lock().await;
        let mut txn = ReplicaTxn::new(Arc::clone(&self.backend));
        let value = f(&mut txn).await?;

        let staged = txn.staged_len();
        if staged == 0 {
            return Ok(value);
        }

        let delta = count(staged);
        self.backend
            .commit(txn.into_batch(delta))
            .await
            .map_err(SyncError::local_write)?;
        self.tracker.record_local_changes(delta);
        drop(guard);

        debug!(records = staged, pending_delta = delta, "Committed local write");
        self.signal_sync();
        Ok(value)
    }

    fn signal_sync(&self) {
        if !self.tracker.snapshot().is_online {
            return;
        }
        // Full means a wake-up is already queued; closed means no scheduler.
        if self.signal.try_send(()).is_ok() {
            debug!("Signalled scheduler after local write");
        }
    }

    // =========================================================================
    // Replication Hooks
    // =========================================================================

    /// Fetches a raw row, tombstones and sync bookkeeping included.
    pub async fn stored(&self, id: &RecordId) -> SyncResult<Option<StoredRecord>> {
        Ok(self.backend.get(id).await?)
    }

    /// Unpushed rows with id greater than `after`.
    pub async fn dirty_page(
        &self,
        after: Option<&RecordId>,
        limit: u32,
    ) -> SyncResult<Vec<StoredRecord>> {
        Ok(self.backend.dirty_page(after, limit).await?)
    }

    /// Commits replication bookkeeping, serialized with local writes.
    pub async fn commit_sync(&self, batch: WriteBatch) -> SyncResult<CommitReport> {
        let _guard = self.write_lock.lock().await;
        self.backend
            .commit(batch)
            .await
            .map_err(SyncError::local_write)
    }

    /// Classifies pulled records against local rows and applies the
    /// non-conflicting ones.
    ///
    /// Classification and commit share the write lock, so no local write can
    /// slip in between and be silently overwritten.
    pub async fn reconcile_page(&self, incoming: Vec<Record>) -> SyncResult<PageOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::new();
        let mut outcome = PageOutcome::default();

        for remote in incoming {
            if let Err(err) = validate_record(&remote) {
                warn!(id = %remote.id, error = %err, "Skipping invalid remote record");
                outcome.rejected.push(remote.id);
                continue;
            }

            match self.backend.get(&remote.id).await? {
                None => {
                    outcome.applied.push(remote.id.clone());
                    batch.push(BatchOp::ApplyRemote(remote));
                }
                Some(row) if !row.dirty => {
                    if !row.record.same_version(&remote) {
                        outcome.applied.push(remote.id.clone());
                        batch.push(BatchOp::ApplyRemote(remote));
                    }
                }
                // Our own push came back before we recorded it as synced.
                Some(row) if row.record.same_version(&remote) => {
                    batch.push(BatchOp::MarkSynced {
                        id: remote.id,
                        updated_at: remote.updated_at,
                    });
                }
                // Pushed earlier, acknowledgement lost, edited again since.
                Some(row) if row.pushed_updated_at == Some(remote.updated_at) => {
                    debug!(id = %remote.id, "Remote holds our earlier push");
                    outcome.echoed += 1;
                    batch.push(BatchOp::AdvanceBase {
                        id: remote.id,
                        updated_at: remote.updated_at,
                    });
                }
                Some(row) if is_conflict(&row.record, &remote, row.base_updated_at) => {
                    let base = row.base_updated_at;
                    outcome
                        .conflicts
                        .push(ConflictRecord::new(row.record, remote, base));
                }
                Some(row) => {
                    debug!(id = %row.record.id, "Remote version predates local edit");
                    outcome.stale += 1;
                }
            }
        }

        if !batch.is_empty() {
            self.backend
                .commit(batch)
                .await
                .map_err(SyncError::local_write)?;
        }
        Ok(outcome)
    }

    /// Stores a user's choice for a conflict left for manual resolution.
    ///
    /// The chosen version is stamped after both conflicting versions and
    /// queued for push like any local edit.
    pub async fn accept_resolution(
        &self,
        conflict: &ConflictRecord,
        mut chosen: Record,
    ) -> SyncResult<Record> {
        if chosen.id != conflict.id {
            return Err(SyncError::LocalWriteFailed(format!(
                "resolution for {} does not match conflict {}",
                chosen.id, conflict.id
            )));
        }

        let guard = self.write_lock.lock().await;
        let current = self.backend.get(&conflict.id).await?;

        let mut floor = conflict.local.updated_at.max(conflict.remote.updated_at);
        chosen.created_at = conflict.local.created_at.min(conflict.remote.created_at);
        if let Some(row) = &current {
            floor = floor.max(row.record.updated_at);
            chosen.created_at = row.record.created_at;
        }
        chosen.updated_at = now().max(next_tick(floor));
        validate_record(&chosen)?;

        let mut batch = WriteBatch::new().pending_delta(1);
        batch.push(BatchOp::Upsert(StoredRecord::local(
            chosen.clone(),
            Some(conflict.remote.updated_at),
        )));
        self.backend
            .commit(batch)
            .await
            .map_err(SyncError::local_write)?;
        self.tracker.record_local_changes(1);
        drop(guard);

        self.signal_sync();
        Ok(chosen)
    }

    pub(crate) fn tracker(&self) -> &Arc<SyncStatusTracker> {
        &self.tracker
    }

    pub(crate) async fn close(&self) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        Ok(self.backend.close().await?)
    }
}

impl std::fmt::Debug for ReplicaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaStore").finish_non_exhaustive()
    }
}
