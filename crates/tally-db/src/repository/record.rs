//! # Record Repository
//!
//! SQL for the `records` table.
//!
//! Reads go through the pool so they can run concurrently with a commit
//! (WAL). Writes take a connection borrowed from an open transaction so
//! every op in a [`crate::WriteBatch`] lands in the same commit.
//!
//! ## Row Encoding
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Record field      Column            Encoding                           │
//! │  ───────────────   ───────────────   ──────────────────────────────     │
//! │  id                id                TEXT                               │
//! │  payload           payload           JSON text                          │
//! │  created_at        created_at        INTEGER µs since epoch             │
//! │  updated_at        updated_at        INTEGER µs since epoch             │
//! │  deleted           deleted           INTEGER 0/1                        │
//! │  (bookkeeping)     dirty             INTEGER 0/1                        │
//! │  (bookkeeping)     base_updated_at   INTEGER µs, NULL = never synced    │
//! │  (bookkeeping)     pushed_updated_at INTEGER µs, last version sent      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use tally_core::types::{from_micros, to_micros};
use tally_core::{Record, RecordId, Timestamp};

use crate::backend::StoredRecord;
use crate::error::{DbError, DbResult};

const SELECT_COLUMNS: &str = "SELECT id, collection, payload, created_at, updated_at, deleted, dirty, base_updated_at, pushed_updated_at FROM records";

#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    collection: String,
    payload: String,
    created_at: i64,
    updated_at: i64,
    deleted: bool,
    dirty: bool,
    base_updated_at: Option<i64>,
    pushed_updated_at: Option<i64>,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = DbError;

    fn try_from(row: RecordRow) -> DbResult<Self> {
        let ts = |micros: i64| {
            from_micros(micros)
                .ok_or_else(|| DbError::corrupt(&row.id, format!("timestamp {micros} out of range")))
        };

        let created_at = ts(row.created_at)?;
        let updated_at = ts(row.updated_at)?;
        let base_updated_at = row.base_updated_at.map(ts).transpose()?;
        let pushed_updated_at = row.pushed_updated_at.map(ts).transpose()?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| DbError::corrupt(&row.id, e.to_string()))?;

        Ok(StoredRecord {
            record: Record {
                id: RecordId::from(row.id),
                collection: row.collection,
                payload,
                created_at,
                updated_at,
                deleted: row.deleted,
            },
            dirty: row.dirty,
            base_updated_at,
            pushed_updated_at,
        })
    }
}

fn decode_all(rows: Vec<RecordRow>) -> DbResult<Vec<StoredRecord>> {
    rows.into_iter().map(StoredRecord::try_from).collect()
}

/// Repository for the `records` table.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Fetches a row by id, tombstones included.
    pub async fn get(&self, id: &RecordId) -> DbResult<Option<StoredRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(StoredRecord::try_from).transpose()
    }

    /// Lists live records, optionally in one collection.
    pub async fn list(&self, collection: Option<&str>) -> DbResult<Vec<Record>> {
        let rows: Vec<RecordRow> = match collection {
            Some(collection) => {
                sqlx::query_as(&format!(
                    "{SELECT_COLUMNS} WHERE deleted = 0 AND collection = ?1 ORDER BY id"
                ))
                .bind(collection)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE deleted = 0 ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(decode_all(rows)?.into_iter().map(|row| row.record).collect())
    }

    /// Keyset page of dirty rows ordered by id.
    pub async fn dirty_page(
        &self,
        after: Option<&RecordId>,
        limit: u32,
    ) -> DbResult<Vec<StoredRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE dirty = 1 AND (?1 IS NULL OR id > ?1) ORDER BY id LIMIT ?2"
        ))
        .bind(after.map(RecordId::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), "Loaded dirty page");
        decode_all(rows)
    }
}

// =============================================================================
// Transactional Writes
// =============================================================================

/// Inserts or replaces a row, keeping the original `created_at` and push
/// marker.
pub(crate) async fn upsert(conn: &mut SqliteConnection, row: &StoredRecord) -> DbResult<()> {
    let record = &row.record;

    sqlx::query(
        r#"
        INSERT INTO records (
            id, collection, payload, created_at, updated_at,
            deleted, dirty, base_updated_at, pushed_updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            collection = excluded.collection,
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            dirty = excluded.dirty,
            base_updated_at = excluded.base_updated_at
        "#,
    )
    .bind(record.id.as_str())
    .bind(&record.collection)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(to_micros(record.created_at))
    .bind(to_micros(record.updated_at))
    .bind(record.deleted)
    .bind(row.dirty)
    .bind(row.base_updated_at.map(to_micros))
    .bind(row.pushed_updated_at.map(to_micros))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Clears `dirty` if the row is still at the pushed version.
pub(crate) async fn mark_synced(
    conn: &mut SqliteConnection,
    id: &RecordId,
    updated_at: Timestamp,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE records SET
            dirty = 0,
            base_updated_at = ?2,
            pushed_updated_at = NULL
        WHERE id = ?1 AND updated_at = ?2 AND dirty = 1
        "#,
    )
    .bind(id.as_str())
    .bind(to_micros(updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Remembers that version `updated_at` is being sent, if the row is dirty.
pub(crate) async fn mark_pushed(
    conn: &mut SqliteConnection,
    id: &RecordId,
    updated_at: Timestamp,
) -> DbResult<bool> {
    let result = sqlx::query("UPDATE records SET pushed_updated_at = ?2 WHERE id = ?1 AND dirty = 1")
        .bind(id.as_str())
        .bind(to_micros(updated_at))
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Moves the base of a dirty row to the version this device pushed.
pub(crate) async fn advance_base(
    conn: &mut SqliteConnection,
    id: &RecordId,
    updated_at: Timestamp,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE records SET base_updated_at = ?2
        WHERE id = ?1 AND dirty = 1 AND pushed_updated_at = ?2
        "#,
    )
    .bind(id.as_str())
    .bind(to_micros(updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Stores a remote version as clean, unless the local row is dirty.
pub(crate) async fn apply_remote(conn: &mut SqliteConnection, record: &Record) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO records (
            id, collection, payload, created_at, updated_at,
            deleted, dirty, base_updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?5)
        ON CONFLICT(id) DO UPDATE SET
            collection = excluded.collection,
            payload = excluded.payload,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            dirty = 0,
            base_updated_at = excluded.updated_at,
            pushed_updated_at = NULL
        WHERE records.dirty = 0
        "#,
    )
    .bind(record.id.as_str())
    .bind(&record.collection)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(to_micros(record.created_at))
    .bind(to_micros(record.updated_at))
    .bind(record.deleted)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Stores a conflict resolution as clean, if the row is still at the
/// version the conflict was raised against.
pub(crate) async fn apply_resolved(
    conn: &mut SqliteConnection,
    record: &Record,
    expected_updated_at: Timestamp,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE records SET
            collection = ?2,
            payload = ?3,
            created_at = ?4,
            updated_at = ?5,
            deleted = ?6,
            dirty = 0,
            base_updated_at = ?5,
            pushed_updated_at = NULL
        WHERE id = ?1 AND updated_at = ?7
        "#,
    )
    .bind(record.id.as_str())
    .bind(&record.collection)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(to_micros(record.created_at))
    .bind(to_micros(record.updated_at))
    .bind(record.deleted)
    .bind(to_micros(expected_updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}
