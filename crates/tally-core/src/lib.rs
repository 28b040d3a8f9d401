//! # tally-core: Pure Replication Logic
//!
//! This crate holds everything about local-first replication that can be
//! expressed without touching a disk or a socket.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Domain / UI (habits, transactions, budgets)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ ReplicaStore::write / read             │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-sync (replication)                     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  conflict  │  │  status   │  │ validation│  │   │
//! │  │   │  Record   │  │  Resolver  │  │ SyncState │  │   rules   │  │   │
//! │  │   │  RecordId │  │  Strategy  │  │ SyncStatus│  │  checks   │  │   │
//! │  │   └───────────┘  └────────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, ids, timestamps, record operations
//! - [`conflict`] - Conflict detection and the `ConflictResolver`
//! - [`status`] - The `Idle`/`Syncing`/`Offline` state machine and snapshots
//! - [`validation`] - Record validation rules
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::conflict::{ConflictResolver, ConflictStrategy, Resolution};
//! use tally_core::Record;
//!
//! let local = Record::new("habit", json!({"name": "Read"}));
//! let mut remote = local.clone();
//! remote.payload = json!({"name": "Read 20 pages"});
//!
//! let resolver = ConflictResolver::new(ConflictStrategy::RemoteWins);
//! match resolver.resolve(&local, &remote) {
//!     Resolution::Resolved(record) => assert_eq!(record.payload, remote.payload),
//!     Resolution::NeedsManualResolution(_) => unreachable!(),
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod status;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{
    ConflictPolicy, ConflictRecord, ConflictResolver, ConflictStrategy, MergeFn, Resolution,
};
pub use error::{CoreError, ValidationError};
pub use status::{StatusEvent, SyncState, SyncStatus};
pub use types::{next_tick, now, Record, RecordId, RecordOp, Timestamp};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum serialized payload size accepted for a single record (1 MiB).
///
/// Keeps one oversized record from stalling a whole push batch.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum length of a collection name ("habit", "transaction", ...).
pub const MAX_COLLECTION_LEN: usize = 64;
