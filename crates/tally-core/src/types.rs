//! # Domain Types
//!
//! The replicated unit of data and the operations applied to it.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Record                                        │
//! │                                                                         │
//! │  id          RecordId (UUID v4)   assigned once, never reassigned       │
//! │  collection  "habit" | "transaction" | "budget" | ...                   │
//! │  payload     opaque JSON owned by the calling domain                    │
//! │  created_at  immutable once set                                         │
//! │  updated_at  non-decreasing per id, never older than created_at         │
//! │  deleted     tombstone flag so deletes replicate like edits             │
//! │                                                                         │
//! │  Record::new ──► ReplicaStore::put ──► (stamped) ──► local storage      │
//! │                                           │                             │
//! │                                           └──► pushed on next reconcile │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamp Precision
//! Timestamps are truncated to microseconds when created so they survive a
//! round trip through storage unchanged. Conflict detection compares them
//! for strict ordering, so any precision lost on the way to disk would
//! show up as a phantom edit.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock timestamp used for `created_at` / `updated_at` and sync cursors.
pub type Timestamp = DateTime<Utc>;

/// Returns the current time truncated to microsecond precision.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}

/// Converts a timestamp to microseconds since the Unix epoch (storage form).
pub fn to_micros(ts: Timestamp) -> i64 {
    ts.timestamp_micros()
}

/// Converts microseconds since the Unix epoch back to a timestamp.
///
/// Returns `None` if the value is outside chrono's representable range.
pub fn from_micros(micros: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_micros(micros)
}

/// Returns the smallest timestamp strictly after `ts` at storage precision.
pub fn next_tick(ts: Timestamp) -> Timestamp {
    ts + Duration::microseconds(1)
}

// =============================================================================
// Record Id
// =============================================================================

/// Stable, globally unique record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generates a fresh UUID v4 id.
    pub fn generate() -> Self {
        RecordId(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId(value.to_string())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Record
// =============================================================================

/// A logical unit of synchronized data (one habit, one transaction, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable id, assigned at creation.
    pub id: RecordId,

    /// Domain collection the record belongs to.
    pub collection: String,

    /// Opaque structured data owned by the calling domain.
    pub payload: serde_json::Value,

    /// Creation time, immutable once set.
    pub created_at: Timestamp,

    /// Last modification time on the writer that produced this version.
    pub updated_at: Timestamp,

    /// Tombstone marker. Deleted records stay in storage so the delete
    /// itself can replicate.
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Creates a new record with a generated id, stamped now.
    pub fn new(collection: impl Into<String>, payload: serde_json::Value) -> Self {
        let at = now();
        Record {
            id: RecordId::generate(),
            collection: collection.into(),
            payload,
            created_at: at,
            updated_at: at,
            deleted: false,
        }
    }

    /// Creates a record with an explicit id and timestamp.
    ///
    /// Used when rehydrating records from another replica or in tests that
    /// need fixed clocks.
    pub fn with_id(
        id: impl Into<RecordId>,
        collection: impl Into<String>,
        payload: serde_json::Value,
        at: Timestamp,
    ) -> Self {
        Record {
            id: id.into(),
            collection: collection.into(),
            payload,
            created_at: at,
            updated_at: at,
            deleted: false,
        }
    }

    /// Returns a copy carrying a new payload. Timestamps are restamped by the
    /// store on write.
    pub fn with_payload(&self, payload: serde_json::Value) -> Self {
        Record {
            payload,
            ..self.clone()
        }
    }

    /// Returns a tombstone version of this record stamped at `at`.
    pub fn tombstone(&self, at: Timestamp) -> Self {
        Record {
            deleted: true,
            updated_at: at,
            ..self.clone()
        }
    }

    /// True if both values describe the same version of the same record.
    pub fn same_version(&self, other: &Record) -> bool {
        self.id == other.id
            && self.updated_at == other.updated_at
            && self.deleted == other.deleted
            && self.payload == other.payload
    }
}

// =============================================================================
// Record Operations
// =============================================================================

/// A single local mutation, used by `ReplicaStore::batch_write`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOp {
    /// Insert or replace a record.
    Put(Record),
    /// Delete a record (writes a tombstone).
    Delete(RecordId),
}

impl RecordOp {
    /// Returns the id this operation targets.
    pub fn id(&self) -> &RecordId {
        match self {
            RecordOp::Put(record) => &record.id,
            RecordOp::Delete(id) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_is_consistent() {
        let record = Record::new("habit", json!({"name": "Stretch"}));
        assert_eq!(record.created_at, record.updated_at);
        assert!(!record.deleted);
        assert_eq!(record.id.as_str().len(), 36);
    }

    #[test]
    fn test_micros_round_trip_is_lossless() {
        let ts = now();
        assert_eq!(from_micros(to_micros(ts)), Some(ts));
    }

    #[test]
    fn test_next_tick_is_strictly_later() {
        let ts = now();
        assert!(next_tick(ts) > ts);
        assert_eq!(to_micros(next_tick(ts)) - to_micros(ts), 1);
    }

    #[test]
    fn test_same_version_ignores_created_at() {
        let a = Record::new("budget", json!({"limit": 500}));
        let mut b = a.clone();
        b.created_at = a.created_at - Duration::seconds(5);
        assert!(a.same_version(&b));

        let c = a.with_payload(json!({"limit": 600}));
        assert!(!a.same_version(&c));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = Record::new("transaction", json!({"amount": 12}));
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("updatedAt").is_some());
        assert!(value.get("createdAt").is_some());
    }
}
