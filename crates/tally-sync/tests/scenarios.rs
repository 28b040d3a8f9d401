//! End-to-end replication behavior across the store, orchestrator,
//! scheduler and remote.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tokio::time::Instant;

use tally_core::{
    ConflictPolicy, ConflictRecord, ConflictResolver, ConflictStrategy, MergeFn, Record, Resolution,
    Timestamp,
};
use tally_db::{Database, DbConfig, LocalStorageBackend, MemoryBackend};
use tally_sync::{
    BackendReplica, DeviceConfig, ManualReachability, MemoryRemote, OrchestratorSettings,
    PullPage, PushReceipt, ReconcileOutcome, ReconcileRequest, RemoteReplica,
    RemoteStorageBackend, ReplicaStore, ResolvedConflict, RetryPolicy, SettleOutcome, SyncAgent,
    SyncConfig, SyncError, SyncOrchestrator, SyncOutcome, SyncResult, SyncStatusTracker,
};

// =============================================================================
// Helpers
// =============================================================================

fn config(device: &str, policy: ConflictPolicy) -> SyncConfig {
    let mut config = SyncConfig::new();
    config.device = DeviceConfig {
        id: device.to_string(),
        name: device.to_string(),
    };
    config.sync.conflict_strategy = policy;
    config.sync.sync_interval_ms = 3_600_000;
    config
}

fn online_store(backend: Arc<dyn LocalStorageBackend>) -> ReplicaStore {
    let tracker = Arc::new(SyncStatusTracker::default());
    tracker.connectivity_changed(true);
    ReplicaStore::new(backend, tracker).0
}

fn orchestrator(
    store: &ReplicaStore,
    remote: Arc<dyn RemoteReplica>,
    attempts: u32,
) -> SyncOrchestrator {
    SyncOrchestrator::new(
        store.clone(),
        remote,
        ConflictResolver::new(ConflictStrategy::RemoteWins),
        OrchestratorSettings {
            retry_attempts: attempts,
            retry_policy: RetryPolicy::Fixed {
                delay: Duration::from_millis(1000),
            },
            remote_timeout: Duration::from_secs(15),
        },
    )
}

async fn wait_until_synced(agent: &SyncAgent) {
    let mut status = agent.subscribe();
    tokio::time::timeout(
        Duration::from_secs(60),
        status.wait_for(|s| s.is_online && !s.is_syncing && s.pending_changes == 0),
    )
    .await
    .expect("agent never finished syncing")
    .expect("status channel closed");
}

fn longest_string_wins() -> MergeFn {
    Arc::new(|local: &Record, remote: &Record| {
        let l = local.payload.to_string();
        let r = remote.payload.to_string();
        // Ties fall back to lexical order so argument order never matters.
        if (l.len(), &l) >= (r.len(), &r) {
            local.clone()
        } else {
            remote.clone()
        }
    })
}

/// Replica that records how many reconcile calls overlap.
struct CountingReplica {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteReplica for CountingReplica {
    async fn reconcile(&self, request: ReconcileRequest) -> SyncResult<ReconcileOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ReconcileOutcome {
            cursor: request.cursor,
            ..Default::default()
        })
    }

    async fn settle(&self, _resolutions: Vec<ResolvedConflict>) -> SyncResult<SettleOutcome> {
        Ok(SettleOutcome::default())
    }
}

/// Replica whose reconcile always fails with a fixed error.
struct FailingReplica {
    error: SyncError,
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteReplica for FailingReplica {
    async fn reconcile(&self, _request: ReconcileRequest) -> SyncResult<ReconcileOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    async fn settle(&self, _resolutions: Vec<ResolvedConflict>) -> SyncResult<SettleOutcome> {
        Ok(SettleOutcome::default())
    }
}

/// Remote that stores the next push but loses its acknowledgement.
struct LostAckRemote {
    inner: MemoryRemote,
    drop_next_ack: AtomicBool,
}

impl LostAckRemote {
    fn new(inner: MemoryRemote) -> Self {
        LostAckRemote {
            inner,
            drop_next_ack: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl RemoteStorageBackend for LostAckRemote {
    async fn connect(&self) -> SyncResult<()> {
        self.inner.connect().await
    }

    async fn pull_since(&self, cursor: Option<Timestamp>, limit: u32) -> SyncResult<PullPage> {
        self.inner.pull_since(cursor, limit).await
    }

    async fn push(&self, records: Vec<Record>) -> SyncResult<PushReceipt> {
        let receipt = self.inner.push(records).await?;
        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(SyncError::RemoteUnavailable("response lost".into()));
        }
        Ok(receipt)
    }

    async fn close(&self) -> SyncResult<()> {
        self.inner.close().await
    }
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_syncs_never_overlap() {
    let store = online_store(Arc::new(MemoryBackend::new()));
    let replica = Arc::new(CountingReplica {
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let orchestrator = Arc::new(orchestrator(&store, replica.clone(), 3));

    let passes = (0..10).map(|_| {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.perform_sync().await })
    });
    let reports: Vec<_> = join_all(passes)
        .await
        .into_iter()
        .map(|joined| joined.expect("sync task panicked"))
        .collect();

    assert_eq!(replica.max_active.load(Ordering::SeqCst), 1);
    let completed = reports
        .iter()
        .filter(|r| r.outcome == SyncOutcome::Completed)
        .count();
    let skipped = reports
        .iter()
        .filter(|r| r.outcome == SyncOutcome::AlreadyInProgress)
        .count();
    assert_eq!(completed, replica.calls.load(Ordering::SeqCst));
    assert_eq!(completed + skipped, 10);
}

#[tokio::test]
async fn committed_write_survives_restart() {
    let path = std::env::temp_dir().join(format!("tally-restart-{}.db", uuid::Uuid::new_v4()));

    let record = {
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let store = online_store(Arc::new(db));
        // No sync, no graceful close: everything is dropped here.
        store
            .put(Record::new("habit", json!({"name": "Meditate"})))
            .await
            .unwrap()
    };

    let db = Arc::new(Database::new(DbConfig::new(&path)).await.unwrap());
    let checkpoint = db.checkpoint().await.unwrap();
    assert!(checkpoint.pending_changes >= 1);

    let tracker = Arc::new(SyncStatusTracker::default());
    tracker.restore(&checkpoint);
    let (store, _) = ReplicaStore::new(db.clone(), tracker);
    assert_eq!(store.get(&record.id).await.unwrap(), Some(record));
    assert!(store.pending_changes() >= 1);

    db.close().await.unwrap();
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[tokio::test]
async fn reconcile_twice_matches_reconcile_once() {
    let store = online_store(Arc::new(MemoryBackend::new()));
    let remote = MemoryRemote::new();
    let replica = BackendReplica::new(Arc::new(remote.clone()), store.clone(), 2);

    for n in 0..3 {
        remote.insert_remote(Record::new("entry", json!({"remote": n})));
        store
            .put(Record::new("entry", json!({"local": n})))
            .await
            .unwrap();
    }

    let first = replica
        .reconcile(ReconcileRequest::default())
        .await
        .unwrap();
    let after_once = store.list(None).await.unwrap();

    replica
        .reconcile(ReconcileRequest::default())
        .await
        .unwrap();
    let after_twice = store.list(None).await.unwrap();

    assert_eq!(first.pulled.len(), 3);
    assert_eq!(first.pushed.len(), 3);
    assert_eq!(after_once, after_twice);
    assert_eq!(after_twice.len(), 6);
    assert!(store.dirty_page(None, 10).await.unwrap().is_empty());
}

#[test]
fn merge_resolution_is_deterministic() {
    let at = tally_core::now();
    let local = Record::with_id("r-1", "note", json!({"text": "short"}), at);
    let mut remote = local.with_payload(json!({"text": "a much longer note"}));
    remote.updated_at = tally_core::next_tick(at);

    let resolver = ConflictResolver::new(ConflictStrategy::Merge(longest_string_wins()));
    let first = resolver.resolve(&local, &remote);
    for _ in 0..10 {
        assert_eq!(resolver.resolve(&local, &remote), first);
    }
}

#[tokio::test]
async fn sync_after_writes_clears_pending_on_sqlite() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let store = online_store(Arc::new(db));
    let remote = MemoryRemote::new();
    let replica = Arc::new(BackendReplica::new(Arc::new(remote.clone()), store.clone(), 100));
    let orchestrator = orchestrator(&store, replica, 3);

    for n in 0..5 {
        store.put(Record::new("entry", json!({"n": n}))).await.unwrap();
    }
    assert_eq!(store.pending_changes(), 5);

    let report = orchestrator.perform_sync().await;

    assert!(report.success);
    assert_eq!(store.pending_changes(), 0);
    assert_eq!(store.checkpoint().await.unwrap().pending_changes, 0);
    assert_eq!(remote.len(), 5);
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn offline_writes_sync_once_connectivity_returns() {
    let remote = MemoryRemote::new();
    let network = Arc::new(ManualReachability::new(false));
    let agent = SyncAgent::builder(config("device-a", ConflictPolicy::RemoteWins))
        .with_local(Arc::new(MemoryBackend::new()))
        .with_remote(Arc::new(remote.clone()))
        .with_reachability(network.clone())
        .build()
        .await
        .unwrap();
    agent.start().unwrap();

    for n in 0..3 {
        agent
            .store()
            .put(Record::new("habit", json!({"n": n})))
            .await
            .unwrap();
    }
    let status = agent.status();
    assert_eq!(status.pending_changes, 3);
    assert!(!status.is_online);
    assert_eq!(remote.connect_count(), 0);

    network.set_online(true);
    wait_until_synced(&agent).await;

    let status = agent.status();
    assert_eq!(status.pending_changes, 0);
    assert!(status.last_sync_at.is_some());
    assert_eq!(remote.connect_count(), 1);
    assert_eq!(remote.len(), 3);

    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_offline_edits_merge_to_longest() {
    let remote = MemoryRemote::new();
    let mut devices = Vec::new();
    for name in ["phone", "laptop"] {
        let network = Arc::new(ManualReachability::new(true));
        let agent = SyncAgent::builder(config(name, ConflictPolicy::Merge))
            .with_local(Arc::new(MemoryBackend::new()))
            .with_remote(Arc::new(remote.clone()))
            .with_reachability(network.clone())
            .with_merge(longest_string_wins())
            .build()
            .await
            .unwrap();
        agent.start().unwrap();
        devices.push((agent, network));
    }
    let (phone, phone_net) = &devices[0];
    let (laptop, laptop_net) = &devices[1];

    // Shared starting point on both devices.
    let note = phone
        .store()
        .put(Record::new("note", json!({"text": "draft"})))
        .await
        .unwrap();
    wait_until_synced(phone).await;
    wait_until_synced(laptop).await;
    assert!(laptop.perform_sync().await.success);
    assert!(laptop.store().get(&note.id).await.unwrap().is_some());

    phone_net.set_online(false);
    laptop_net.set_online(false);
    let mut offline = phone.subscribe();
    offline.wait_for(|s| !s.is_online).await.unwrap();
    let mut offline = laptop.subscribe();
    offline.wait_for(|s| !s.is_online).await.unwrap();

    phone
        .store()
        .put(note.with_payload(json!({"text": "draft with a much longer body"})))
        .await
        .unwrap();
    laptop
        .store()
        .put(note.with_payload(json!({"text": "draft v2"})))
        .await
        .unwrap();

    // Laptop reaches the remote first, so the phone sees the conflict.
    laptop_net.set_online(true);
    wait_until_synced(laptop).await;
    phone_net.set_online(true);
    wait_until_synced(phone).await;
    assert!(laptop.perform_sync().await.success);

    let expected = json!({"text": "draft with a much longer body"});
    let on_phone = phone.store().get(&note.id).await.unwrap().unwrap();
    let on_laptop = laptop.store().get(&note.id).await.unwrap().unwrap();
    assert_eq!(on_phone.payload, expected);
    assert_eq!(on_phone, on_laptop);
    assert_eq!(remote.get(&note.id).unwrap(), on_phone);

    // Same answer with the arguments swapped.
    let resolver = ConflictResolver::new(ConflictStrategy::Merge(longest_string_wins()));
    let short = note.with_payload(json!({"text": "draft v2"}));
    let long = note.with_payload(expected.clone());
    let pick = |r: Resolution| match r {
        Resolution::Resolved(record) => record.payload,
        Resolution::NeedsManualResolution(_) => panic!("merge never defers"),
    };
    assert_eq!(pick(resolver.resolve(&short, &long)), expected);
    assert_eq!(pick(resolver.resolve(&long, &short)), expected);

    for (agent, _) in &devices {
        agent.shutdown().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_delay() {
    let store = online_store(Arc::new(MemoryBackend::new()));
    let remote = MemoryRemote::new();
    remote.fail_next_with(SyncError::RemoteUnavailable("attempt 1".into()));
    remote.fail_next_with(SyncError::RemoteUnavailable("attempt 2".into()));
    let replica = Arc::new(BackendReplica::new(Arc::new(remote.clone()), store.clone(), 100));
    let orchestrator = orchestrator(&store, replica, 3);
    store.put(Record::new("entry", json!({}))).await.unwrap();

    let started = Instant::now();
    let report = orchestrator.perform_sync().await;
    let elapsed = started.elapsed();

    assert!(report.success);
    assert_eq!(report.attempts, 3);
    assert_eq!(remote.connect_count(), 3);
    assert!(elapsed >= Duration::from_millis(2000));
    assert!(elapsed < Duration::from_millis(3000));
    assert_eq!(store.pending_changes(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejection_fails_immediately() {
    let store = online_store(Arc::new(MemoryBackend::new()));
    let replica = Arc::new(FailingReplica {
        error: SyncError::RemoteRejected("validation failed".into()),
        calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(&store, replica.clone(), 3);
    for n in 0..2 {
        store.put(Record::new("entry", json!({"n": n}))).await.unwrap();
    }

    let started = Instant::now();
    let report = orchestrator.perform_sync().await;

    assert!(!report.success);
    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert_eq!(report.attempts, 1);
    assert_eq!(replica.calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(store.pending_changes(), 2);
    assert_eq!(store.checkpoint().await.unwrap().pending_changes, 2);
}

async fn edit_after_lost_ack_survives(backend: Arc<dyn LocalStorageBackend>) {
    let store = online_store(backend);
    let remote = MemoryRemote::new();
    let replica = Arc::new(BackendReplica::new(
        Arc::new(LostAckRemote::new(remote.clone())),
        store.clone(),
        100,
    ));
    let orchestrator = orchestrator(&store, replica, 1);

    let v1 = store.put(Record::new("habit", json!({"v": 1}))).await.unwrap();
    let v2 = store.put(v1.with_payload(json!({"v": 2}))).await.unwrap();
    let first = orchestrator.perform_sync().await;
    assert!(!first.success);
    assert_eq!(remote.get(&v1.id).map(|r| r.payload), Some(json!({"v": 2})));

    let v3 = store.put(v2.with_payload(json!({"v": 3}))).await.unwrap();
    let second = orchestrator.perform_sync().await;

    assert!(second.success);
    assert_eq!(second.conflicts_resolved, 0);
    assert_eq!(store.get(&v1.id).await.unwrap(), Some(v3.clone()));
    assert_eq!(remote.get(&v1.id), Some(v3));
    assert_eq!(store.pending_changes(), 0);
}

#[tokio::test]
async fn edit_after_lost_ack_survives_in_memory() {
    edit_after_lost_ack_survives(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn edit_after_lost_ack_survives_on_sqlite() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    edit_after_lost_ack_survives(Arc::new(db)).await;
}

// =============================================================================
// Manual resolution
// =============================================================================

#[tokio::test]
async fn manual_conflicts_stay_pending_until_resolved() {
    let remote = MemoryRemote::new();
    let agent = SyncAgent::builder(config("device-m", ConflictPolicy::Manual))
        .with_local(Arc::new(MemoryBackend::new()))
        .with_remote(Arc::new(remote.clone()))
        .build()
        .await
        .unwrap();
    agent.start().unwrap();
    let mut online = agent.subscribe();
    online.wait_for(|s| s.is_online).await.unwrap();

    let record = agent
        .store()
        .put(Record::new("habit", json!({"v": "base"})))
        .await
        .unwrap();
    wait_until_synced(&agent).await;

    // Another device edits the remote copy while this one edits locally.
    let mut theirs = record.with_payload(json!({"v": "theirs"}));
    theirs.updated_at = tally_core::next_tick(tally_core::now());
    remote.insert_remote(theirs.clone());
    agent
        .store()
        .put(record.with_payload(json!({"v": "mine"})))
        .await
        .unwrap();

    let mut report = agent.perform_sync().await;
    if report.outcome == SyncOutcome::AlreadyInProgress {
        // The write signal started a pass first; wait for it and re-run.
        let mut idle = agent.subscribe();
        idle.wait_for(|s| !s.is_syncing).await.unwrap();
        report = agent.perform_sync().await;
    }
    assert!(report.success);
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(agent.status().pending_changes, 1);
    assert_eq!(remote.get(&record.id).unwrap().payload, json!({"v": "theirs"}));

    let conflicts: Vec<ConflictRecord> = agent.unresolved_conflicts();
    assert_eq!(conflicts.len(), 1);
    let chosen = conflicts[0].local.with_payload(json!({"v": "both"}));
    agent.resolve_conflict(&conflicts[0], chosen).await.unwrap();
    assert!(agent.unresolved_conflicts().is_empty());

    wait_until_synced(&agent).await;
    let report = agent.perform_sync().await;
    assert!(report.success);
    assert!(report.unresolved.is_empty());
    assert_eq!(remote.get(&record.id).unwrap().payload, json!({"v": "both"}));
    assert_eq!(agent.status().pending_changes, 0);

    agent.shutdown().await.unwrap();
}
