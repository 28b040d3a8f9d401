//! Two devices sharing one in-memory remote.
//!
//! Walks through offline writes, reconnect sync and a merged conflict.
//! Run with `RUST_LOG=tally_sync=debug` for the full trace.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use tally_core::{ConflictPolicy, MergeFn, Record};
use tally_db::MemoryBackend;
use tally_sync::{
    init_logging, DeviceConfig, ManualReachability, MemoryRemote, SyncAgent, SyncConfig,
    SyncError, SyncResult,
};

/// Numbers keep the larger value, everything else prefers the remote side.
fn merge_payloads(local: &Record, remote: &Record) -> Record {
    let mut merged = remote.payload.clone();
    if let (Some(out), Some(mine)) = (merged.as_object_mut(), local.payload.as_object()) {
        for (key, value) in mine {
            match (out.get(key).and_then(Value::as_f64), value.as_f64()) {
                (Some(theirs), Some(ours)) if ours > theirs => {
                    out.insert(key.clone(), value.clone());
                }
                (None, _) if !out.contains_key(key) => {
                    out.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
    }
    remote.with_payload(merged)
}

struct Device {
    name: &'static str,
    agent: SyncAgent,
    network: Arc<ManualReachability>,
}

impl Device {
    async fn new(name: &'static str, remote: &MemoryRemote) -> SyncResult<Self> {
        let mut config = SyncConfig::new();
        config.device = DeviceConfig {
            id: format!("sim-{name}"),
            name: name.to_string(),
        };
        config.sync.conflict_strategy = ConflictPolicy::Merge;
        config.sync.sync_interval_ms = 60_000;

        let network = Arc::new(ManualReachability::new(false));
        let merge: MergeFn = Arc::new(merge_payloads);
        let agent = SyncAgent::builder(config)
            .with_local(Arc::new(MemoryBackend::new()))
            .with_remote(Arc::new(remote.clone()))
            .with_reachability(network.clone())
            .with_merge(merge)
            .build()
            .await?;
        agent.start()?;

        Ok(Device {
            name,
            agent,
            network,
        })
    }

    /// Goes online and waits for the automatic sync to drain local changes.
    async fn reconnect(&self) -> SyncResult<()> {
        let mut status = self.agent.subscribe();
        self.network.set_online(true);

        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.is_online && !s.is_syncing && s.pending_changes == 0),
        )
        .await
        .map_err(|_| SyncError::Internal(format!("{} did not settle", self.name)))?
        .map_err(|e| SyncError::ChannelError(e.to_string()))?;

        info!(device = self.name, "Device online and in sync");
        Ok(())
    }

    async fn show(&self) -> SyncResult<()> {
        let status = self.agent.status();
        println!(
            "[{}] state={} pending={} last_sync={:?}",
            self.name, status.state, status.pending_changes, status.last_sync_at
        );
        for record in self.agent.store().list(None).await? {
            println!("    {} {}", record.id, record.payload);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> SyncResult<()> {
    init_logging("tally_sync=info");

    let remote = MemoryRemote::new();
    let phone = Device::new("phone", &remote).await?;
    let laptop = Device::new("laptop", &remote).await?;

    println!("== Offline create on phone");
    let habit = phone
        .agent
        .store()
        .put(Record::new("habit", json!({"name": "Read", "streak": 0})))
        .await?;
    phone.show().await?;

    println!("== Both devices come online");
    phone.reconnect().await?;
    laptop.reconnect().await?;
    let report = laptop.agent.perform_sync().await;
    println!("laptop pulled {} record(s)", report.pulled);
    laptop.show().await?;

    println!("== Concurrent offline edits");
    phone.network.set_online(false);
    laptop.network.set_online(false);
    let phone_view = phone.agent.store().get(&habit.id).await?;
    let laptop_view = laptop.agent.store().get(&habit.id).await?;
    if let (Some(on_phone), Some(on_laptop)) = (phone_view, laptop_view) {
        phone
            .agent
            .store()
            .put(on_phone.with_payload(json!({"name": "Read 20 pages", "streak": 0})))
            .await?;
        laptop
            .agent
            .store()
            .put(on_laptop.with_payload(json!({"name": "Read", "streak": 5})))
            .await?;
    }

    println!("== Reconnect and merge");
    phone.reconnect().await?;
    laptop.reconnect().await?;
    let report = phone.agent.perform_sync().await;
    println!(
        "phone pass: pulled={} pushed={} success={}",
        report.pulled, report.pushed, report.success
    );

    phone.show().await?;
    laptop.show().await?;

    phone.agent.shutdown().await?;
    laptop.agent.shutdown().await?;
    Ok(())
}
