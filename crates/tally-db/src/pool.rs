//! # SQLite Replica Storage
//!
//! The durable [`LocalStorageBackend`]: one SQLite file per device.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Database::new(DbConfig)                                                │
//! │      │  WAL journal, NORMAL sync, busy timeout                          │
//! │      ├── migrate_on_open ──► migrations/sqlite/*.sql                    │
//! │      ▼                                                                  │
//! │  commit(WriteBatch)                                                     │
//! │      BEGIN                                                              │
//! │        records     upsert / mark synced / apply remote / apply resolved │
//! │        checkpoint  pending delta, last_sync_at, cursor                  │
//! │      COMMIT          (any error ──► ROLLBACK, nothing visible)          │
//! │                                                                         │
//! │  get / list / dirty_page / checkpoint ──► pooled read connections       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! WAL lets status indicators and UI reads proceed while a sync pass is
//! committing pulled records.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use tally_core::{Record, RecordId};

use crate::backend::{BatchOp, Checkpoint, CommitReport, LocalStorageBackend, StoredRecord, WriteBatch};
use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::checkpoint::{self, CheckpointRepository};
use crate::repository::record::{self, RecordRepository};

const IN_MEMORY: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where and how to open the local replica.
///
/// ```rust,ignore
/// let config = DbConfig::new("/data/tally.db").busy_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    /// SQLite file, or `:memory:`.
    pub path: PathBuf,

    /// Pool size. Writes are serialized above this layer, so extra
    /// connections only serve reads.
    pub max_connections: u32,

    /// How long a statement waits on a locked database.
    pub busy_timeout: Duration,

    /// How long to wait for a free pooled connection.
    pub acquire_timeout: Duration,

    /// Apply pending migrations while opening.
    pub migrate_on_open: bool,
}

impl DbConfig {
    /// File-backed replica. The file and its parent must be writable.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: path.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            migrate_on_open: true,
        }
    }

    /// Private in-memory replica, gone when the pool closes.
    ///
    /// Every SQLite connection to `:memory:` is a separate database, so the
    /// pool is pinned to one connection.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            ..DbConfig::new(IN_MEMORY)
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn migrate_on_open(mut self, migrate: bool) -> Self {
        self.migrate_on_open = migrate;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY)
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true)
        };

        Ok(options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout))
    }
}

// =============================================================================
// Database
// =============================================================================

/// SQLite-backed local replica.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the replica described by `config`.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let options = config.connect_options()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            // A closed idle connection would drop an in-memory replica.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            path = %config.path.display(),
            connections = config.max_connections,
            "Opened local replica"
        );

        let db = Database { pool };
        if config.migrate_on_open {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Brings the schema up to date. Safe to repeat.
    pub async fn migrate(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await?;
        debug!("Local schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }

    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone())
    }

    /// True if the replica still answers queries.
    pub async fn health_check(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[async_trait]
impl LocalStorageBackend for Database {
    async fn open(&self) -> DbResult<()> {
        if self.pool.is_closed() {
            return Err(DbError::Closed);
        }
        self.migrate().await
    }

    async fn get(&self, id: &RecordId) -> DbResult<Option<StoredRecord>> {
        self.records().get(id).await
    }

    async fn list(&self, collection: Option<&str>) -> DbResult<Vec<Record>> {
        self.records().list(collection).await
    }

    async fn dirty_page(
        &self,
        after: Option<&RecordId>,
        limit: u32,
    ) -> DbResult<Vec<StoredRecord>> {
        self.records().dirty_page(after, limit).await
    }

    async fn commit(&self, batch: WriteBatch) -> DbResult<CommitReport> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let mut report = CommitReport::default();
        for op in &batch.ops {
            let applied = match op {
                BatchOp::Upsert(row) => {
                    record::upsert(&mut *tx, row).await?;
                    true
                }
                BatchOp::MarkSynced { id, updated_at } => {
                    record::mark_synced(&mut *tx, id, *updated_at).await?
                }
                BatchOp::MarkPushed { id, updated_at } => {
                    record::mark_pushed(&mut *tx, id, *updated_at).await?
                }
                BatchOp::AdvanceBase { id, updated_at } => {
                    record::advance_base(&mut *tx, id, *updated_at).await?
                }
                BatchOp::ApplyRemote(remote) => record::apply_remote(&mut *tx, remote).await?,
                BatchOp::ApplyResolved {
                    record: resolved,
                    expected_updated_at,
                } => record::apply_resolved(&mut *tx, resolved, *expected_updated_at).await?,
            };

            if applied {
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }

        if batch.pending_delta != 0 || batch.last_sync_at.is_some() || batch.remote_cursor.is_some()
        {
            checkpoint::apply(&mut *tx, batch.pending_delta, batch.last_sync_at, batch.remote_cursor)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(applied = report.applied, skipped = report.skipped, "Batch committed");
        Ok(report)
    }

    async fn checkpoint(&self) -> DbResult<Checkpoint> {
        self.checkpoints().get().await
    }

    async fn close(&self) -> DbResult<()> {
        self.pool.close().await;
        info!("Closed local replica");
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::types::{next_tick, now};

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_replica_is_migrated() {
        let db = db().await;
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/tally.db")
            .max_connections(0)
            .migrate_on_open(false);

        assert_eq!(config.max_connections, 1);
        assert!(!config.migrate_on_open);
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }

    #[tokio::test]
    async fn test_closed_replica_is_unhealthy() {
        let db = db().await;
        db.close().await.unwrap();
        assert!(!db.health_check().await);
        assert!(matches!(db.open().await, Err(DbError::Closed)));
    }

    #[tokio::test]
    async fn test_commit_round_trips_record() {
        let db = db().await;
        let record = Record::new("habit", json!({"name": "Journal", "streak": 4}));

        let mut batch = WriteBatch::new().pending_delta(1);
        batch.push(BatchOp::Upsert(StoredRecord::local(record.clone(), None)));
        db.commit(batch).await.unwrap();

        let stored = db.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.record, record);
        assert!(stored.dirty);
        assert_eq!(stored.base_updated_at, None);
        assert_eq!(db.checkpoint().await.unwrap().pending_changes, 1);
        assert_eq!(db.dirty_page(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_hides_tombstones_and_filters_collection() {
        let db = db().await;
        let habit = Record::new("habit", json!({}));
        let budget = Record::new("budget", json!({}));
        let gone = Record::new("habit", json!({}));
        let gone = gone.tombstone(next_tick(gone.updated_at));

        let mut batch = WriteBatch::new();
        for r in [&habit, &budget, &gone] {
            batch.push(BatchOp::Upsert(StoredRecord::local(r.clone(), None)));
        }
        db.commit(batch).await.unwrap();

        assert_eq!(db.list(None).await.unwrap().len(), 2);
        let habits = db.list(Some("habit")).await.unwrap();
        assert_eq!(habits, vec![habit]);
        assert!(db.get(&gone.id).await.unwrap().unwrap().record.deleted);
    }

    #[tokio::test]
    async fn test_apply_remote_respects_dirty_rows() {
        let db = db().await;
        let local = Record::new("transaction", json!({"amount": 10}));

        let mut batch = WriteBatch::new();
        batch.push(BatchOp::Upsert(StoredRecord::local(local.clone(), None)));
        db.commit(batch).await.unwrap();

        let mut remote = local.with_payload(json!({"amount": 99}));
        remote.updated_at = next_tick(local.updated_at);

        let mut batch = WriteBatch::new();
        batch.push(BatchOp::ApplyRemote(remote.clone()));
        assert_eq!(db.commit(batch).await.unwrap().skipped, 1);

        let mut batch = WriteBatch::new();
        batch.push(BatchOp::MarkSynced {
            id: local.id.clone(),
            updated_at: local.updated_at,
        });
        batch.push(BatchOp::ApplyRemote(remote.clone()));
        let report = db.commit(batch).await.unwrap();
        assert_eq!(report.applied, 2);

        let stored = db.get(&local.id).await.unwrap().unwrap();
        assert_eq!(stored.record.payload, json!({"amount": 99}));
        assert!(!stored.dirty);
        assert_eq!(stored.base_updated_at, Some(remote.updated_at));
    }

    #[tokio::test]
    async fn test_push_marker_survives_local_edit() {
        let db = db().await;
        let sent = Record::new("habit", json!({"streak": 1}));

        let mut batch = WriteBatch::new();
        batch.push(BatchOp::Upsert(StoredRecord::local(sent.clone(), None)));
        batch.push(BatchOp::MarkPushed {
            id: sent.id.clone(),
            updated_at: sent.updated_at,
        });
        db.commit(batch).await.unwrap();

        let mut edit = sent.with_payload(json!({"streak": 2}));
        edit.updated_at = next_tick(sent.updated_at);
        let mut batch = WriteBatch::new();
        batch.push(BatchOp::Upsert(StoredRecord::local(edit.clone(), None)));
        batch.push(BatchOp::AdvanceBase {
            id: sent.id.clone(),
            updated_at: sent.updated_at,
        });
        assert_eq!(db.commit(batch).await.unwrap().applied, 2);

        let stored = db.get(&sent.id).await.unwrap().unwrap();
        assert!(stored.dirty);
        assert_eq!(stored.record.payload, edit.payload);
        assert_eq!(stored.base_updated_at, Some(sent.updated_at));
        assert_eq!(stored.pushed_updated_at, Some(sent.updated_at));

        let mut batch = WriteBatch::new();
        batch.push(BatchOp::MarkSynced {
            id: sent.id.clone(),
            updated_at: edit.updated_at,
        });
        db.commit(batch).await.unwrap();
        let stored = db.get(&sent.id).await.unwrap().unwrap();
        assert!(!stored.dirty);
        assert_eq!(stored.pushed_updated_at, None);
    }

    #[tokio::test]
    async fn test_checkpoint_counter_floors_at_zero() {
        let db = db().await;
        let at = now();

        let mut batch = WriteBatch::new().pending_delta(2);
        batch.remote_cursor = Some(at);
        db.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new().pending_delta(-5);
        batch.last_sync_at = Some(at);
        db.commit(batch).await.unwrap();

        let checkpoint = db.checkpoint().await.unwrap();
        assert_eq!(checkpoint.pending_changes, 0);
        assert_eq!(checkpoint.last_sync_at, Some(at));
        assert_eq!(checkpoint.remote_cursor, Some(at));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let db = db().await;
        let good = Record::new("habit", json!({}));
        let mut bad = Record::new("habit", json!({}));
        bad.updated_at = bad.created_at - chrono::Duration::seconds(1);

        let mut batch = WriteBatch::new().pending_delta(2);
        batch.push(BatchOp::Upsert(StoredRecord::local(good.clone(), None)));
        batch.push(BatchOp::Upsert(StoredRecord::local(bad, None)));

        let err = db.commit(batch).await.unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
        assert!(db.get(&good.id).await.unwrap().is_none());
        assert_eq!(db.checkpoint().await.unwrap().pending_changes, 0);
    }
}
