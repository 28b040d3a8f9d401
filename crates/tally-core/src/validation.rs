//! # Validation Module
//!
//! Checks a record must pass before it is written locally.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Domain (habits, budgets, ...)                                 │
//! │  └── Payload shape, owned by the caller                                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: ReplicaStore                                                  │
//! │  └── THIS MODULE: id, collection, timestamps, payload size              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Local storage (SQLite)                                        │
//! │  ├── PRIMARY KEY on id (one entry per id)                               │
//! │  └── CHECK updated_at >= created_at                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::Record;
use crate::{MAX_COLLECTION_LEN, MAX_PAYLOAD_BYTES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a collection name.
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_collection;
///
/// assert!(validate_collection("habit").is_ok());
/// assert!(validate_collection("  ").is_err());
/// ```
pub fn validate_collection(collection: &str) -> ValidationResult<()> {
    let collection = collection.trim();

    if collection.is_empty() {
        return Err(ValidationError::EmptyCollection);
    }

    let len = collection.chars().count();
    if len > MAX_COLLECTION_LEN {
        return Err(ValidationError::CollectionTooLong {
            len,
            max: MAX_COLLECTION_LEN,
        });
    }

    Ok(())
}

/// Validates a record before it is staged for a local write.
///
/// ## Rules
/// - Id must not be empty
/// - Collection must be a valid name
/// - `updated_at` must not be older than `created_at`
/// - Serialized payload must fit in [`MAX_PAYLOAD_BYTES`]
pub fn validate_record(record: &Record) -> ValidationResult<()> {
    if record.id.as_str().trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }

    validate_collection(&record.collection)?;

    if record.updated_at < record.created_at {
        return Err(ValidationError::TimestampOrder {
            id: record.id.to_string(),
        });
    }

    let size = record.payload.to_string().len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            id: record.id.to_string(),
            size,
            max: MAX_PAYLOAD_BYTES,
        });
    }

    Ok(())
}
