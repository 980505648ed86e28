// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-node payload-mesh walkthrough.
//!
//! Demonstrates, entirely in-process:
//! 1. Two nodes sharing one bus and one durable store
//! 2. A profile activated on `lobby-1` and edited without saving
//! 3. The same profile activated on `lobby-2`, which flushes `lobby-1` first
//! 4. An update broadcast merging into a sibling's outstanding reference
//! 5. The metrics emitted along the way
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=payload_mesh=debug cargo run --example two_nodes
//! ```

use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use payload_mesh::{
    Cache, CacheBuilder, Database, MemoryBus, MemoryDocumentBackend, Payload, PayloadConfig,
    PayloadMeta,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    unique_id: String,
    username: String,
    coins: i64,
    #[serde(skip)]
    meta: PayloadMeta,
}

impl Payload for Profile {
    type Key = String;
    const ID_FIELD: &'static str = "uniqueId";

    fn identifier(&self) -> String { self.unique_id.clone() }
    fn name(&self) -> String { self.username.clone() }
    fn meta(&self) -> &PayloadMeta { &self.meta }
    fn meta_mut(&mut self) -> &mut PayloadMeta { &mut self.meta }
}

async fn node(
    name: &str,
    bus: Arc<MemoryBus>,
    backend: Arc<MemoryDocumentBackend>,
) -> Result<Cache<Profile>, Box<dyn std::error::Error>> {
    let config = PayloadConfig {
        node_name: name.to_string(),
        development_mode: true,
        ..Default::default()
    };
    let database = Database::with_backends(config, backend, bus);
    database.start().await?;

    let cache = CacheBuilder::new("profiles", database)
        .mobile()
        .instantiator(|id: &String| Profile {
            unique_id: id.clone(),
            username: String::new(),
            coins: 0,
            meta: PayloadMeta::default(),
        })
        .build()?;
    cache.start().await?;
    Ok(cache)
}

fn print_metrics(snapshotter: &Snapshotter) {
    println!("\n📊 Metrics:");
    let mut rows: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| format!("   {} {:?} = {:?}", key.key().name(), key.key().labels().collect::<Vec<_>>(), value))
        .collect();
    rows.sort();
    for row in rows {
        println!("{}", row);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let bus = Arc::new(MemoryBus::new());
    let backend = Arc::new(MemoryDocumentBackend::new());

    println!("🚀 Starting lobby-1 and lobby-2...");
    let lobby1 = node("lobby-1", bus.clone(), backend.clone()).await?;
    let lobby2 = node("lobby-2", bus.clone(), backend.clone()).await?;
    while !lobby2.database().nodes().is_online("lobby-1") {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let id = "3f2a".to_string();
    let on_lobby1 = lobby1.activate(&id, "Steve").await.ok_or("activation failed")?;
    on_lobby1.write().coins = 250;
    println!("   lobby-1 holds {} coins (unsaved)", on_lobby1.read().coins);

    println!("\n🔀 Steve moves to lobby-2...");
    let on_lobby2 = lobby2.activate(&id, "Steve").await.ok_or("activation failed")?;
    lobby1.deactivate(&id, true).await;
    println!("   lobby-2 loaded {} coins", on_lobby2.read().coins);

    println!("\n📣 lobby-2 grants a bonus and broadcasts it...");
    let watcher = lobby1.get(&id).await.ok_or("not found")?;
    on_lobby2.write().coins += 50;
    lobby2.save(&on_lobby2).await;
    lobby2.push_update(&on_lobby2, false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   lobby-1's reference now reads {} coins", watcher.read().coins);

    print_metrics(&snapshotter);

    lobby1.shutdown().await?;
    lobby2.shutdown().await?;
    lobby1.database().shutdown().await;
    lobby2.database().shutdown().await;
    println!("\n✅ Done");
    Ok(())
}
