//! # Sync Error Types
//!
//! Error types for replication operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Local         │  │     Remote              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  LocalWrite-    │  │  RemoteUnavailable  ↻   │ │
//! │  │  MissingDeviceId│  │    Failed       │  │  RemoteRejected     ✗   │ │
//! │  │  ConfigLoad/Save│  │  LocalReadFailed│  │                         │ │
//! │  │                 │  │  Validation     │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │   Conflicts     │  │   Scheduling / Internal                     │  │
//! │  │                 │  │                                             │  │
//! │  │  NeedsManual-   │  │  AlreadyInProgress  Offline  ShuttingDown   │  │
//! │  │    Resolution   │  │  ChannelError       Internal                │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  ↻ = retried by the orchestrator    ✗ = fatal for the sync pass        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tally_core::{CoreError, ValidationError};
use tally_db::DbError;

pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all replication failures.
///
/// Cloneable so the same error can sit in a `SyncReport`, the tracker's
/// last-error field and an emitter callback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A setting the engine cannot run with, or a missing merge function.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("No device id configured")]
    MissingDeviceId,

    /// sync.toml exists but could not be read or parsed.
    #[error("Cannot load sync.toml: {0}")]
    ConfigLoadFailed(String),

    #[error("Cannot save sync.toml: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// A local transaction aborted. Nothing from it was applied.
    ///
    /// ## When This Occurs
    /// - SQLite commit failed (disk full, constraint, closed pool)
    /// - Closure passed to `ReplicaStore::write` returned an error
    #[error("Local write failed: {0}")]
    LocalWriteFailed(String),

    /// A local read failed.
    #[error("Local read failed: {0}")]
    LocalReadFailed(String),

    /// Record failed validation before being staged.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Transient connectivity failure or timeout. Retried per configuration.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote store refused the data. Never retried within a pass.
    #[error("Remote rejected: {0}")]
    RemoteRejected(String),

    // =========================================================================
    // Scheduling / Internal Errors
    // =========================================================================
    /// A sync pass is already running.
    #[error("Sync already in progress")]
    AlreadyInProgress,

    /// Device is offline.
    #[error("Device is offline")]
    Offline,

    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// A status or signal channel closed underneath a waiter.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl SyncError {
    /// Maps a storage error on a write path.
    pub fn local_write(err: DbError) -> Self {
        SyncError::LocalWriteFailed(err.to_string())
    }
}

/// Storage errors default to the read classification; write paths go
/// through [`SyncError::local_write`].
impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::LocalReadFailed(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::Validation(v),
            CoreError::MergeFunctionMissing | CoreError::UnknownPolicy(_) => {
                SyncError::InvalidConfig(err.to_string())
            }
            CoreError::InvalidTransition { .. } => SyncError::Internal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the orchestrator may retry the failed remote call.
    ///
    /// Only transient remote failures qualify. A rejection means the remote
    /// will refuse the same data again, and local failures must surface to
    /// whoever issued the write.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error came from device-local storage.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SyncError::LocalWriteFailed(_) | SyncError::LocalReadFailed(_)
        )
    }
}
