//! In-process remote store.
//!
//! Shared between simulated devices by cloning. Every stored version gets a
//! strictly increasing receive stamp, which is what pull cursors track.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use tally_core::{next_tick, now, Record, RecordId, Timestamp};

use super::{PullPage, PushReceipt, RemoteStorageBackend};
use crate::error::{SyncError, SyncResult};

#[derive(Debug)]
struct Stored {
    record: Record,
    received_at: Timestamp,
}

#[derive(Debug)]
struct Inner {
    records: BTreeMap<RecordId, Stored>,
    last_stamp: Option<Timestamp>,
    reachable: bool,
    queued_failures: VecDeque<SyncError>,
    reject_next_push: Option<String>,
    connects: u64,
}

impl Inner {
    fn stamp(&mut self) -> Timestamp {
        let at = match self.last_stamp {
            Some(last) => now().max(next_tick(last)),
            None => now(),
        };
        self.last_stamp = Some(at);
        at
    }

    fn store(&mut self, record: Record) {
        let received_at = self.stamp();
        self.records
            .insert(record.id.clone(), Stored { record, received_at });
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(SyncError::RemoteUnavailable("remote unreachable".into()))
        }
    }
}

/// Remote store held in memory.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        MemoryRemote {
            inner: Arc::new(Mutex::new(Inner {
                records: BTreeMap::new(),
                last_stamp: None,
                reachable: true,
                queued_failures: VecDeque::new(),
                reject_next_push: None,
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every call fail with `RemoteUnavailable` while false.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Queues an error for the next `connect`. Several calls queue several
    /// failures, consumed in order.
    pub fn fail_next_with(&self, err: SyncError) {
        self.lock().queued_failures.push_back(err);
    }

    /// Makes the next push refuse every record with `reason`.
    pub fn reject_next_push(&self, reason: impl Into<String>) {
        self.lock().reject_next_push = Some(reason.into());
    }

    /// Writes a record directly, as another device would have.
    pub fn insert_remote(&self, record: Record) {
        self.lock().store(record);
    }

    /// Current remote version of a record, tombstones included.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.lock().records.get(id).map(|s| s.record.clone())
    }

    /// All remote versions, ordered by id.
    pub fn records(&self) -> Vec<Record> {
        self.lock()
            .records
            .values()
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Number of `connect` calls, failed ones included.
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        MemoryRemote::new()
    }
}

#[async_trait]
impl RemoteStorageBackend for MemoryRemote {
    async fn connect(&self) -> SyncResult<()> {
        let mut inner = self.lock();
        inner.connects += 1;
        if let Some(err) = inner.queued_failures.pop_front() {
            return Err(err);
        }
        inner.check_reachable()
    }

    async fn pull_since(&self, cursor: Option<Timestamp>, limit: u32) -> SyncResult<PullPage> {
        let inner = self.lock();
        inner.check_reachable()?;

        let mut newer: Vec<&Stored> = inner
            .records
            .values()
            .filter(|s| cursor.map_or(true, |c| s.received_at > c))
            .collect();
        newer.sort_by_key(|s| s.received_at);
        newer.truncate(limit as usize);

        Ok(PullPage {
            cursor: newer.last().map(|s| s.received_at),
            records: newer.into_iter().map(|s| s.record.clone()).collect(),
        })
    }

    async fn push(&self, records: Vec<Record>) -> SyncResult<PushReceipt> {
        let mut inner = self.lock();
        inner.check_reachable()?;
        if let Some(reason) = inner.reject_next_push.take() {
            return Err(SyncError::RemoteRejected(reason));
        }

        let received_after = inner.last_stamp;
        let accepted: Vec<RecordId> = records.iter().map(|r| r.id.clone()).collect();
        for record in records {
            inner.store(record);
        }
        debug!(count = accepted.len(), "Remote accepted push");

        Ok(PushReceipt {
            accepted,
            received_after,
            cursor: inner.last_stamp,
        })
    }

    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pull_pages_in_receive_order() {
        let remote = MemoryRemote::new();
        let ids: Vec<RecordId> = (0..3)
            .map(|n| {
                let record = Record::new("entry", json!({"n": n}));
                let id = record.id.clone();
                remote.insert_remote(record);
                id
            })
            .collect();

        let page = remote.pull_since(None, 2).await.unwrap();
        assert_eq!(
            page.records.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );

        let rest = remote.pull_since(page.cursor, 2).await.unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].id, ids[2]);

        let empty = remote.pull_since(rest.cursor, 2).await.unwrap();
        assert!(empty.records.is_empty());
        assert!(empty.cursor.is_none());
    }

    #[tokio::test]
    async fn test_queued_failures_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        remote.fail_next_with(SyncError::RemoteUnavailable("one".into()));
        remote.fail_next_with(SyncError::RemoteRejected("two".into()));

        assert!(remote.connect().await.unwrap_err().is_retryable());
        assert!(!remote.connect().await.unwrap_err().is_retryable());
        assert!(remote.connect().await.is_ok());
        assert_eq!(remote.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_push_receipt_reports_receive_range() {
        let remote = MemoryRemote::new();
        remote.insert_remote(Record::new("entry", json!({"from": "other"})));
        let seen = remote.pull_since(None, 10).await.unwrap().cursor;

        let receipt = remote
            .push(vec![Record::new("entry", json!({"from": "us"}))])
            .await
            .unwrap();
        assert_eq!(receipt.received_after, seen);
        assert_eq!(receipt.resume_cursor(seen), receipt.cursor);
        assert!(remote.pull_since(receipt.cursor, 10).await.unwrap().records.is_empty());

        // Someone else wrote after our last pull; the gap must be pulled.
        remote.insert_remote(Record::new("entry", json!({"from": "other"})));
        let receipt = remote
            .push(vec![Record::new("entry", json!({"from": "us"}))])
            .await
            .unwrap();
        assert_ne!(receipt.received_after, seen);
        assert_eq!(receipt.resume_cursor(seen), seen);
    }

    #[tokio::test]
    async fn test_rejected_push_stores_nothing() {
        let remote = MemoryRemote::new();
        remote.reject_next_push("read only");

        let err = remote
            .push(vec![Record::new("entry", json!({}))])
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::RemoteRejected("read only".into()));
        assert!(remote.is_empty());
    }
}
