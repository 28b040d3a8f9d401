//! # Conflict Detection & Resolution
//!
//! Decides what happens when a reconcile pass finds the same record id
//! modified on both replicas.
//!
//! ## Detection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Checkpoint-relative conflicts                         │
//! │                                                                         │
//! │  base = updated_at of the version both replicas last agreed on          │
//! │                                                                         │
//! │           base                                                          │
//! │            │                                                            │
//! │  local  ───●────────────●  local.updated_at  > base                     │
//! │            │                                                            │
//! │  remote ───●──────●        remote.updated_at > base                     │
//! │                                                                         │
//! │  Both changed after the agreed version  ──►  CONFLICT                   │
//! │  Only one side changed                  ──►  fast-forward, no conflict  │
//! │  Identical versions                     ──►  never a conflict           │
//! │                                                                         │
//! │  No base yet (never synced from this device): each side's created_at   │
//! │  stands in for the agreed version, so the pair conflicts only when     │
//! │  local.updated_at > remote.created_at AND                              │
//! │  remote.updated_at > local.created_at                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//! For a fixed strategy and a fixed `(local, remote)` pair, `resolve` always
//! returns the same record. Merge results have their bookkeeping fields
//! normalized (`id`, `collection`, `created_at`, `updated_at`) so two devices
//! re-deriving the same conflict converge on identical rows.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Record, RecordId, Timestamp};

// =============================================================================
// Conflict Record
// =============================================================================

/// A local and a remote version of one id that were modified concurrently.
///
/// Lives for a single reconcile pass; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub id: RecordId,
    pub local: Record,
    pub remote: Record,
    /// `updated_at` of the last version both replicas agreed on, if any.
    pub base: Option<Timestamp>,
}

impl ConflictRecord {
    pub fn new(local: Record, remote: Record, base: Option<Timestamp>) -> Self {
        ConflictRecord {
            id: local.id.clone(),
            local,
            remote,
            base,
        }
    }
}

/// Returns true if `local` and `remote` were modified independently since
/// `base`, the last version both replicas agreed on.
///
/// With no base, each side's `created_at` is the last state the other side
/// could have seen.
pub fn is_conflict(local: &Record, remote: &Record, base: Option<Timestamp>) -> bool {
    if local.same_version(remote) {
        return false;
    }

    match base {
        Some(base) => local.updated_at > base && remote.updated_at > base,
        None => local.updated_at > remote.created_at && remote.updated_at > local.created_at,
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Caller-supplied merge function. Must be pure and deterministic.
pub type MergeFn = Arc<dyn Fn(&Record, &Record) -> Record + Send + Sync>;

/// How conflicts are settled. Selected once, at orchestrator construction.
#[derive(Clone)]
pub enum ConflictStrategy {
    /// Always keep the remote version.
    RemoteWins,
    /// Always keep the local version.
    LocalWins,
    /// Combine both versions with a caller-supplied function.
    Merge(MergeFn),
    /// Defer to the user; the conflict is surfaced, never auto-applied.
    Manual,
}

impl std::fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::RemoteWins => write!(f, "RemoteWins"),
            ConflictStrategy::LocalWins => write!(f, "LocalWins"),
            ConflictStrategy::Merge(_) => write!(f, "Merge(<fn>)"),
            ConflictStrategy::Manual => write!(f, "Manual"),
        }
    }
}

impl ConflictStrategy {
    /// Builds a strategy from its configured name.
    ///
    /// `Merge` needs the function; config files can only name the policy.
    pub fn from_policy(policy: ConflictPolicy, merge: Option<MergeFn>) -> Result<Self, CoreError> {
        match policy {
            ConflictPolicy::RemoteWins => Ok(ConflictStrategy::RemoteWins),
            ConflictPolicy::LocalWins => Ok(ConflictStrategy::LocalWins),
            ConflictPolicy::Manual => Ok(ConflictStrategy::Manual),
            ConflictPolicy::Merge => merge
                .map(ConflictStrategy::Merge)
                .ok_or(CoreError::MergeFunctionMissing),
        }
    }

    /// The configuration name of this strategy.
    pub fn policy(&self) -> ConflictPolicy {
        match self {
            ConflictStrategy::RemoteWins => ConflictPolicy::RemoteWins,
            ConflictStrategy::LocalWins => ConflictPolicy::LocalWins,
            ConflictStrategy::Merge(_) => ConflictPolicy::Merge,
            ConflictStrategy::Manual => ConflictPolicy::Manual,
        }
    }
}

/// Serializable name of a strategy, as it appears in `sync.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    RemoteWins,
    LocalWins,
    Merge,
    Manual,
}

impl FromStr for ConflictPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote_wins" => Ok(ConflictPolicy::RemoteWins),
            "local_wins" => Ok(ConflictPolicy::LocalWins),
            "merge" => Ok(ConflictPolicy::Merge),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(CoreError::UnknownPolicy(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictPolicy::RemoteWins => "remote_wins",
            ConflictPolicy::LocalWins => "local_wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::Manual => "manual",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The version to keep on both replicas.
    Resolved(Record),
    /// `Manual` strategy: the pair must be surfaced to the user.
    NeedsManualResolution(ConflictRecord),
}

/// Pure conflict resolver.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        ConflictResolver { strategy }
    }

    pub fn strategy(&self) -> &ConflictStrategy {
        &self.strategy
    }

    /// Resolves a local/remote pair with no known common base.
    pub fn resolve(&self, local: &Record, remote: &Record) -> Resolution {
        self.resolve_conflict(&ConflictRecord::new(local.clone(), remote.clone(), None))
    }

    /// Resolves a conflict found during reconcile.
    pub fn resolve_conflict(&self, conflict: &ConflictRecord) -> Resolution {
        let local = &conflict.local;
        let remote = &conflict.remote;

        match &self.strategy {
            ConflictStrategy::RemoteWins => Resolution::Resolved(remote.clone()),
            ConflictStrategy::LocalWins => Resolution::Resolved(local.clone()),
            ConflictStrategy::Merge(merge) => {
                let merged = merge(local, remote);
                Resolution::Resolved(normalize_merged(local, remote, merged))
            }
            ConflictStrategy::Manual => Resolution::NeedsManualResolution(conflict.clone()),
        }
    }
}

/// Pins the fields a merge function must not influence.
fn normalize_merged(local: &Record, remote: &Record, merged: Record) -> Record {
    Record {
        id: local.id.clone(),
        collection: local.collection.clone(),
        created_at: local.created_at.min(remote.created_at),
        updated_at: local.updated_at.max(remote.updated_at),
        payload: merged.payload,
        deleted: merged.deleted,
    }
}
