//! Cache Demo Application
//!
//! Warms reference data, serves a stale read while it refreshes in the
//! background, invalidates by rule and prints the collected metrics. Runs
//! entirely against the in-memory store.
//!
//! Usage:
//!   cargo run --example cache_demo

use async_trait::async_trait;
use observation_cache::{
    CacheConfig, CacheContext, ChangeSignal, ChangeSource, MemoryStore, ObservationSource,
    ReferenceList, SwrOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// Upstream stand-in returning canned payloads
struct CannedSource;

#[async_trait]
impl ObservationSource for CannedSource {
    async fn observation(&self, id: i64) -> observation_cache::Result<Value> {
        Ok(json!({"id": id, "species": 1}))
    }

    async fn species(&self, id: i64) -> observation_cache::Result<Value> {
        Ok(json!({"id": id, "name": format!("species {}", id)}))
    }

    async fn user_observations(&self, user_id: i64, _limit: usize) -> observation_cache::Result<Value> {
        Ok(json!({"results": [{"id": 1, "user": user_id, "species": 2}]}))
    }

    async fn species_observations(&self, _species_id: i64, _limit: usize) -> observation_cache::Result<Value> {
        Ok(json!({"results": []}))
    }

    async fn reference_list(&self, list: ReferenceList) -> observation_cache::Result<Value> {
        Ok(json!({"results": [list.cache_key()]}))
    }
}

struct QuietChanges;

#[async_trait]
impl ChangeSource for QuietChanges {
    async fn poll(&self, _endpoint: &str) -> observation_cache::Result<ChangeSignal> {
        Ok(ChangeSignal::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("=== Observation Cache Demo ===");

    let context = CacheContext::with_store(
        CacheConfig::testing(),
        Arc::new(MemoryStore::new()),
        Arc::new(QuietChanges),
    );

    info!("\n--- Warming reference data ---");
    let report = context.warmer(Arc::new(CannedSource)).warm_cache().await;
    info!("Warmed {} lists in {}ms", report.warmed.len(), report.duration_ms);

    info!("\n--- Stale-while-revalidate ---");
    let options = SwrOptions::new()
        .prefix("observations")
        .ttl(1)
        .stale_while_revalidate(30)
        .tags(["observations"]);

    let first = context
        .swr()
        .get("recent", || async { Ok(json!(["first"])) }, &options)
        .await?;
    info!("First read: {:?} {}", first.status, first.data);

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let stale = context
        .swr()
        .get("recent", || async { Ok(json!(["second"])) }, &options)
        .await?;
    info!(
        "Stale read: {:?} {} (revalidating: {})",
        stale.status, stale.data, stale.revalidating
    );

    context.tasks().wait_idle().await;

    let refreshed = context
        .swr()
        .get("recent", || async { Ok(json!(["unused"])) }, &options)
        .await?;
    info!("After refresh: {:?} {}", refreshed.status, refreshed.data);

    info!("\n--- Rule invalidation ---");
    let removed = context
        .invalidation()
        .invalidate_by_rule("new-observations", None)
        .await;
    info!("new-observations removed {} entries", removed);

    info!("\n--- Metrics ---");
    info!("{}", serde_json::to_string_pretty(&context.metrics().snapshot())?);

    context.close().await;
    Ok(())
}
