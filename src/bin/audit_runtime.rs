//! Audit Runtime - ingestion, sealing and daily pooling
//!
//! Reads raw content as JSONL on stdin, seals it into per-topic storage trees
//! and periodically rolls those up into level 2, 1 and 0 daily trees.
//!
//! Usage:
//!   producer | cargo run --release --bin audit_runtime
//!
//! Each stdin line:
//!   {"topic": "prices", "timestamp": "2024-01-01T00:00:00Z", "payload": "<hex>"}
//!
//! Environment variables:
//!   ENABLE_AUDIT_TRAIL - Master switch (default: false)
//!   AUDIT_DB_PATH - SQLite store path (default: /var/lib/audit/audit.db)
//!   AUDIT_TOPICS - Comma separated topics pooled at level 2
//!   AUDIT_SEAL_INTERVAL_MS - Sealing interval (default: 60000)
//!   AUDIT_POOL_INTERVAL_MS - Pooling interval (default: 86400000)
//!   See `AuditConfig::from_env` for the rest.

use audit_trail::pipeline::{
    config::AuditConfig, forward_jsonl, pooling_scheduler_task, start_audit_ingestion,
    RawContent,
};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 Audit Runtime");

    let config = AuditConfig::from_env()?;

    if !config.enabled {
        info!("⚠️  Audit trail is DISABLED (set ENABLE_AUDIT_TRAIL=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }

    info!("✅ Audit trail ENABLED");
    info!("   ├─ Store: {}", config.db_path);
    info!("   ├─ Pool index: {:?} ({})", config.cache_backend, config.cache_path);
    info!("   ├─ Topics: {:?}", config.topics);
    info!("   ├─ Channel buffer: {}", config.channel_buffer);
    info!("   ├─ Seal interval: {}ms (max {} leaves)", config.seal_interval_ms, config.seal_max_leaves);
    info!("   └─ Pool interval: {}ms", config.pool_interval_ms);

    if config.topics.is_empty() {
        warn!("⚠️  AUDIT_TOPICS is empty, no level 2 trees will be pooled");
    }

    let trail = Arc::new(config.open_trail()?);

    let (tx, rx) = mpsc::channel::<RawContent>(config.channel_buffer);

    let ingestion = tokio::spawn(start_audit_ingestion(
        rx,
        trail.clone(),
        config.seal_interval_ms,
        config.seal_max_leaves,
    ));
    info!("   ├─ ✅ Ingestion task spawned");

    let scheduler = tokio::spawn(pooling_scheduler_task(
        trail.clone(),
        config.topics.clone(),
        config.pool_interval_ms,
    ));
    info!("   ├─ ✅ Pooling scheduler spawned");

    let source = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match forward_jsonl(stdin, tx).await {
            Ok(count) => info!("stdin closed after {} items", count),
            Err(e) => error!("❌ stdin source failed: {}", e),
        }
    });
    info!("   └─ ✅ stdin source spawned");

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    // Dropping the source closes the channel; ingestion then seals what is left
    source.abort();
    scheduler.abort();

    if timeout(Duration::from_secs(10), ingestion).await.is_err() {
        warn!("⚠️  Ingestion did not finish within 10s");
    }

    if let Err(e) = trail.flush_audit_batch() {
        error!("❌ Final audit batch flush failed: {}", e);
    }

    info!("✅ Audit runtime stopped");
    Ok(())
}
