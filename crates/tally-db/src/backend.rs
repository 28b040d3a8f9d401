//! # Local Storage Backend Contract
//!
//! The narrow interface the replication core uses to reach device storage.
//! SQLite ([`crate::Database`]) and an in-memory map
//! ([`crate::MemoryBackend`]) both implement it.
//!
//! ## Write Batches
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    One WriteBatch = One Transaction                     │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Upsert(row)               local write, row becomes dirty        │   │
//! │  │  MarkSynced{id, v}         dirty → clean, only if still at v     │   │
//! │  │  MarkPushed{id, v}         remember v was sent, row stays dirty  │   │
//! │  │  AdvanceBase{id, v}        base := v, only if v was sent by us   │   │
//! │  │  ApplyRemote(record)       only if the local row is clean        │   │
//! │  │  ApplyResolved{record, v}  only if the local row is still at v   │   │
//! │  │  pending_delta             counter += delta (floor 0)           │   │
//! │  │  last_sync_at / cursor     checkpoint fields                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← all ops and the counter change land together, or none do     │
//! │                                                                         │
//! │  Conditional ops that no longer match are skipped, not failed: a       │
//! │  local write that raced a sync pass always survives.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

use tally_core::{Record, RecordId, Timestamp};

use crate::error::DbResult;

// =============================================================================
// Stored Shapes
// =============================================================================

/// A record plus its local replication bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: Record,

    /// Local change not yet confirmed by the remote replica.
    pub dirty: bool,

    /// `updated_at` of the last version both replicas agreed on.
    pub base_updated_at: Option<Timestamp>,

    /// `updated_at` of the last version this device sent to the remote,
    /// acknowledged or not. Lets a pull recognize its own echo after a lost
    /// acknowledgement.
    pub pushed_updated_at: Option<Timestamp>,
}

impl StoredRecord {
    /// A locally written row.
    pub fn local(record: Record, base_updated_at: Option<Timestamp>) -> Self {
        StoredRecord {
            record,
            dirty: true,
            base_updated_at,
            pushed_updated_at: None,
        }
    }

    /// A row that matches the remote replica.
    pub fn synced(record: Record) -> Self {
        let base = Some(record.updated_at);
        StoredRecord {
            record,
            dirty: false,
            base_updated_at: base,
            pushed_updated_at: None,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.record.id
    }
}

/// Persisted sync progress, committed alongside the records it describes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub pending_changes: u64,
    pub last_sync_at: Option<Timestamp>,
    /// Remote-assigned position of the last pulled delta.
    pub remote_cursor: Option<Timestamp>,
}

// =============================================================================
// Write Batch
// =============================================================================

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Insert or replace a row as-is. `created_at` and `pushed_updated_at`
    /// of an existing row are kept.
    Upsert(StoredRecord),

    /// Clears `dirty` and sets the base, if the row is still dirty at
    /// `updated_at`.
    MarkSynced {
        id: RecordId,
        updated_at: Timestamp,
    },

    /// Records that version `updated_at` is about to be sent, if the row is
    /// still dirty. Committed before the push so a lost acknowledgement
    /// cannot hide it.
    MarkPushed {
        id: RecordId,
        updated_at: Timestamp,
    },

    /// Moves the base to `updated_at` and leaves the row dirty, if this
    /// device pushed exactly that version.
    AdvanceBase {
        id: RecordId,
        updated_at: Timestamp,
    },

    /// Stores a remote version as clean, unless the local row is dirty.
    ApplyRemote(Record),

    /// Stores a conflict resolution as clean, if the local row still has
    /// `expected_updated_at` (the version the conflict was raised against).
    ApplyResolved {
        record: Record,
        expected_updated_at: Timestamp,
    },
}

/// Atomic unit of local change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,

    /// Added to the persisted pending counter; the result floors at 0.
    pub pending_delta: i64,

    /// When set, replaces the checkpoint's `last_sync_at`.
    pub last_sync_at: Option<Timestamp>,

    /// When set, replaces the checkpoint's remote cursor.
    pub remote_cursor: Option<Timestamp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn pending_delta(mut self, delta: i64) -> Self {
        self.pending_delta = delta;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
            && self.pending_delta == 0
            && self.last_sync_at.is_none()
            && self.remote_cursor.is_none()
    }
}

/// What a commit did with its conditional operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Applies `delta` to a counter, flooring at zero.
pub fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Device-local storage used by the replication core.
///
/// Reads hide tombstones except where noted. `commit` is all-or-nothing.
#[async_trait]
pub trait LocalStorageBackend: Send + Sync + 'static {
    /// Prepares the backend for use. Idempotent.
    async fn open(&self) -> DbResult<()>;

    /// Fetches a row by id, tombstones included.
    async fn get(&self, id: &RecordId) -> DbResult<Option<StoredRecord>>;

    /// Lists live records, optionally restricted to one collection,
    /// ordered by id.
    async fn list(&self, collection: Option<&str>) -> DbResult<Vec<Record>>;

    /// Returns up to `limit` dirty rows with id greater than `after`,
    /// ordered by id. Tombstones included.
    async fn dirty_page(&self, after: Option<&RecordId>, limit: u32)
        -> DbResult<Vec<StoredRecord>>;

    /// Applies a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> DbResult<CommitReport>;

    /// Reads the persisted checkpoint.
    async fn checkpoint(&self) -> DbResult<Checkpoint>;

    /// Releases resources. Later calls fail with `DbError::Closed`.
    async fn close(&self) -> DbResult<()>;
}
