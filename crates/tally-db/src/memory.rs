//! # In-Memory Backend
//!
//! A [`LocalStorageBackend`] over a `BTreeMap`, with the same conditional
//! batch semantics as the SQLite backend. Used by fast tests and for
//! ephemeral replicas that do not need to survive a restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tally_core::{Record, RecordId};

use crate::backend::{
    apply_delta, BatchOp, Checkpoint, CommitReport, LocalStorageBackend, StoredRecord, WriteBatch,
};
use crate::error::{DbError, DbResult};

#[derive(Debug, Default)]
struct Inner {
    closed: bool,
    rows: BTreeMap<RecordId, StoredRecord>,
    checkpoint: Checkpoint,
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
    fail_next_commit: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    /// Makes the next `commit` fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of rows currently marked dirty.
    pub async fn dirty_count(&self) -> usize {
        self.inner.read().await.rows.values().filter(|r| r.dirty).count()
    }
}

/// Mirrors the `updated_at >= created_at` CHECK on the SQLite table.
fn check_constraints(ops: &[BatchOp]) -> DbResult<()> {
    for op in ops {
        let record = match op {
            BatchOp::Upsert(row) => &row.record,
            BatchOp::ApplyRemote(record) | BatchOp::ApplyResolved { record, .. } => record,
            _ => continue,
        };
        if record.updated_at < record.created_at {
            return Err(DbError::ConstraintViolation(format!(
                "CHECK constraint failed: updated_at >= created_at ({})",
                record.id
            )));
        }
    }
    Ok(())
}

fn apply_op(rows: &mut BTreeMap<RecordId, StoredRecord>, op: BatchOp) -> bool {
    match op {
        BatchOp::Upsert(mut row) => {
            if let Some(existing) = rows.get(row.id()) {
                row.record.created_at = existing.record.created_at;
                row.pushed_updated_at = existing.pushed_updated_at;
            }
            rows.insert(row.id().clone(), row);
            true
        }

        BatchOp::MarkSynced { id, updated_at } => match rows.get_mut(&id) {
            Some(row) if row.dirty && row.record.updated_at == updated_at => {
                row.dirty = false;
                row.base_updated_at = Some(updated_at);
                row.pushed_updated_at = None;
                true
            }
            _ => false,
        },

        BatchOp::MarkPushed { id, updated_at } => match rows.get_mut(&id) {
            Some(row) if row.dirty => {
                row.pushed_updated_at = Some(updated_at);
                true
            }
            _ => false,
        },

        BatchOp::AdvanceBase { id, updated_at } => match rows.get_mut(&id) {
            Some(row) if row.dirty && row.pushed_updated_at == Some(updated_at) => {
                row.base_updated_at = Some(updated_at);
                true
            }
            _ => false,
        },

        BatchOp::ApplyRemote(record) => match rows.get(&record.id) {
            Some(row) if row.dirty => false,
            _ => {
                rows.insert(record.id.clone(), StoredRecord::synced(record));
                true
            }
        },

        BatchOp::ApplyResolved {
            record,
            expected_updated_at,
        } => match rows.get(&record.id) {
            Some(row) if row.record.updated_at == expected_updated_at => {
                rows.insert(record.id.clone(), StoredRecord::synced(record));
                true
            }
            _ => false,
        },
    }
}

#[async_trait]
impl LocalStorageBackend for MemoryBackend {
    async fn open(&self) -> DbResult<()> {
        self.inner.write().await.closed = false;
        Ok(())
    }

    async fn get(&self, id: &RecordId) -> DbResult<Option<StoredRecord>> {
        let inner = self.inner.read().await;
        if inner.closed {
            return Err(DbError::Closed);
        }
        Ok(inner.rows.get(id).cloned())
    }

    async fn list(&self, collection: Option<&str>) -> DbResult<Vec<Record>> {
        let inner = self.inner.read().await;
        if inner.closed {
            return Err(DbError::Closed);
        }
        Ok(inner
            .rows
            .values()
            .filter(|row| !row.record.deleted)
            .filter(|row| collection.map_or(true, |c| row.record.collection == c))
            .map(|row| row.record.clone())
            .collect())
    }

    async fn dirty_page(
        &self,
        after: Option<&RecordId>,
        limit: u32,
    ) -> DbResult<Vec<StoredRecord>> {
        let inner = self.inner.read().await;
        if inner.closed {
            return Err(DbError::Closed);
        }
        Ok(inner
            .rows
            .values()
            .filter(|row| row.dirty)
            .filter(|row| after.map_or(true, |after| row.id() > after))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> DbResult<CommitReport> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(DbError::Closed);
        }
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DbError::TransactionFailed("injected failure".to_string()));
        }
        check_constraints(&batch.ops)?;

        let mut report = CommitReport::default();
        for op in batch.ops {
            if apply_op(&mut inner.rows, op) {
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }

        let checkpoint = &mut inner.checkpoint;
        checkpoint.pending_changes = apply_delta(checkpoint.pending_changes, batch.pending_delta);
        if batch.last_sync_at.is_some() {
            checkpoint.last_sync_at = batch.last_sync_at;
        }
        if batch.remote_cursor.is_some() {
            checkpoint.remote_cursor = batch.remote_cursor;
        }

        debug!(applied = report.applied, skipped = report.skipped, "Memory batch committed");
        Ok(report)
    }

    async fn checkpoint(&self) -> DbResult<Checkpoint> {
        let inner = self.inner.read().await;
        if inner.closed {
            return Err(DbError::Closed);
        }
        Ok(inner.checkpoint.clone())
    }

    async fn close(&self) -> DbResult<()> {
        self.inner.write().await.closed = true;
        Ok(())
    }
}
