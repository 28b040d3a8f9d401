//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Strategy / state machine failures              │
//! │  └── ValidationError  - Record validation failures                     │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Local storage failures                         │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - LocalWriteFailed, RemoteUnavailable, ...       │
//! │                                                                         │
//! │  Flow: ValidationError → SyncError → caller of ReplicaStore::write     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::status::{StatusEvent, SyncState};

// =============================================================================
// Core Error
// =============================================================================

/// Core replication logic errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// The status state machine refused a transition.
    ///
    /// ## When This Occurs
    /// - `SyncTriggered` while `Offline` (must pass through `Idle` first)
    /// - `SyncTriggered` while already `Syncing`
    #[error("Invalid status transition: {event:?} while {from}")]
    InvalidTransition { from: SyncState, event: StatusEvent },

    /// The `merge` conflict policy was selected but no merge function given.
    #[error("Conflict policy 'merge' requires a merge function")]
    MergeFunctionMissing,

    /// Unknown conflict policy name.
    #[error("Unknown conflict strategy: '{0}'. Valid options: remote_wins, local_wins, merge, manual")]
    UnknownPolicy(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Record validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Record id is empty.
    #[error("Record id must not be empty")]
    EmptyId,

    /// Collection name is empty.
    #[error("Collection must not be empty")]
    EmptyCollection,

    /// Collection name exceeds the maximum length.
    #[error("Collection name too long: {len} characters (max {max})")]
    CollectionTooLong { len: usize, max: usize },

    /// `updated_at` is older than `created_at`.
    #[error("Record {id} has updated_at older than created_at")]
    TimestampOrder { id: String },

    /// Serialized payload exceeds the size limit.
    #[error("Record {id} payload is {size} bytes (max {max})")]
    PayloadTooLarge { id: String, size: usize, max: usize },
}
