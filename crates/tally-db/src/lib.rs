//! # tally-db: Local Storage Layer for Tally
//!
//! Device-local persistence for the replication engine. Everything the
//! sync layer needs from storage goes through [`LocalStorageBackend`].
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  ReplicaStore::write / BackendReplica::reconcile   (tally-sync)        │
//! │       │                                                                 │
//! │       │  LocalStorageBackend::commit(WriteBatch)                        │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│ RecordRepo    │    │ 001, 002 ... │  │   │
//! │  │   │   SqlitePool  │    │ CheckpointRepo│    │  (embedded)  │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐                                             │   │
//! │  │   │ MemoryBackend │  same contract, no disk                     │   │
//! │  │   └───────────────┘                                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/tally.db                                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`backend`] - The `LocalStorageBackend` contract and write batches
//! - [`pool`] - SQLite pool creation and the SQLite backend
//! - [`memory`] - In-memory backend
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - SQL per table
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig, LocalStorageBackend};
//!
//! let db = Database::new(DbConfig::new("path/to/tally.db")).await?;
//! let checkpoint = db.checkpoint().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backend;
pub mod error;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{
    BatchOp, Checkpoint, CommitReport, LocalStorageBackend, StoredRecord, WriteBatch,
};
pub use error::{DbError, DbResult};
pub use memory::MemoryBackend;
pub use pool::{Database, DbConfig};

pub use repository::checkpoint::CheckpointRepository;
pub use repository::record::RecordRepository;
