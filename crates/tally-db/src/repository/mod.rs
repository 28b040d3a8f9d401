//! # Repository Module
//!
//! SQL for the SQLite backend, one repository per table.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database (LocalStorageBackend)                                         │
//! │       │                                                                 │
//! │       │  reads: db.records().get(id)          (pool, concurrent)        │
//! │       │  writes: record::upsert(&mut *tx, ..) (inside one transaction)  │
//! │       ▼                                                                 │
//! │  RecordRepository           CheckpointRepository                        │
//! │  ├── get / list             ├── get                                     │
//! │  └── dirty_page             └── apply (counter delta, cursor)           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod checkpoint;
pub mod record;
