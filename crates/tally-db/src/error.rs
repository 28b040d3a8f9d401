//! # Local Storage Errors
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  sqlx::Error ─────┐                                                     │
//! │  MigrateError ────┼──► DbError ──► SyncError::LocalWriteFailed          │
//! │  serde_json ──────┤                 (commit paths)                      │
//! │  bad stored row ──┘             ──► SyncError::LocalReadFailed          │
//! │                                     (everything else)                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Failure inside a local storage backend.
#[derive(Debug, Error)]
pub enum DbError {
    /// The SQLite file could not be opened or created.
    #[error("Cannot open local replica: {0}")]
    ConnectionFailed(String),

    /// Schema migration did not complete.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A CHECK or UNIQUE constraint rejected a row, e.g. `updated_at`
    /// older than `created_at`.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A statement failed for any other reason.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// BEGIN or COMMIT failed; nothing from the batch is visible.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// A stored row could not be decoded back into a record.
    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },

    /// Backend used after `close`.
    #[error("Storage backend is closed")]
    Closed,

    /// No pooled connection became free in time.
    #[error("Timed out waiting for a database connection")]
    PoolTimedOut,

    #[error("Storage error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::CorruptRow {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message().to_string();
                if msg.contains("constraint failed") {
                    DbError::ConstraintViolation(msg)
                } else {
                    DbError::QueryFailed(msg)
                }
            }
            sqlx::Error::PoolTimedOut => DbError::PoolTimedOut,
            sqlx::Error::PoolClosed => DbError::Closed,
            sqlx::Error::Migrate(e) => DbError::MigrationFailed(e.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Internal(format!("payload serialization: {err}"))
    }
}

pub type DbResult<T> = Result<T, DbError>;
