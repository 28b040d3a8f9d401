//! # Checkpoint Repository
//!
//! The single-row `sync_checkpoint` table: pending change counter, last
//! successful sync time and the remote pull cursor.
//!
//! The counter is only ever moved by a delta inside the same transaction
//! as the record changes it counts, so a crash can never leave one
//! without the other.

use sqlx::{FromRow, SqliteConnection, SqlitePool};

use tally_core::types::{from_micros, to_micros};
use tally_core::Timestamp;

use crate::backend::Checkpoint;
use crate::error::{DbError, DbResult};

#[derive(Debug, FromRow)]
struct CheckpointRow {
    pending_changes: i64,
    last_sync_at: Option<i64>,
    remote_cursor: Option<i64>,
}

fn decode_ts(column: &str, micros: Option<i64>) -> DbResult<Option<Timestamp>> {
    micros
        .map(|m| from_micros(m).ok_or_else(|| DbError::corrupt("sync_checkpoint", column)))
        .transpose()
}

/// Repository for the sync checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    /// Creates a new CheckpointRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CheckpointRepository { pool }
    }

    /// Reads the checkpoint row.
    pub async fn get(&self) -> DbResult<Checkpoint> {
        let row: CheckpointRow = sqlx::query_as(
            "SELECT pending_changes, last_sync_at, remote_cursor FROM sync_checkpoint WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Checkpoint {
            pending_changes: row.pending_changes.max(0) as u64,
            last_sync_at: decode_ts("last_sync_at", row.last_sync_at)?,
            remote_cursor: decode_ts("remote_cursor", row.remote_cursor)?,
        })
    }
}

/// Moves the counter by `delta` (floor 0) and replaces whichever of the
/// timestamp fields are given.
pub(crate) async fn apply(
    conn: &mut SqliteConnection,
    delta: i64,
    last_sync_at: Option<Timestamp>,
    remote_cursor: Option<Timestamp>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE sync_checkpoint SET
            pending_changes = MAX(0, pending_changes + ?1),
            last_sync_at = COALESCE(?2, last_sync_at),
            remote_cursor = COALESCE(?3, remote_cursor)
        WHERE id = 1
        "#,
    )
    .bind(delta)
    .bind(last_sync_at.map(to_micros))
    .bind(remote_cursor.map(to_micros))
    .execute(&mut *conn)
    .await?;

    Ok(())
}
