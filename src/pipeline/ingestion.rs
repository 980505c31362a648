//! Audit ingestion - async channel processor for raw content
//!
//! Raw content is buffered per topic and sealed into storage trees on a timer,
//! or early when a topic's buffer fills up. A single task owns every buffer, so
//! sealing is serialized per topic.

use crate::audit_core::{AuditTrail, RawLeaf};
use crate::error::AuditResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};

/// One piece of raw content delivered to the audit trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Leaves waiting to be sealed, per topic
#[derive(Debug)]
pub struct SealBuffer {
    pending: HashMap<String, Vec<RawLeaf>>,
    max_leaves: usize,
}

impl SealBuffer {
    pub fn new(max_leaves: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_leaves: max_leaves.max(1),
        }
    }

    /// Buffer `content`; true when its topic reached the leaf threshold
    pub fn push(&mut self, content: RawContent) -> bool {
        let leaves = self.pending.entry(content.topic).or_default();
        leaves.push(RawLeaf::new(content.payload, content.timestamp));
        leaves.len() >= self.max_leaves
    }

    pub fn pending_leaves(&self, topic: &str) -> usize {
        self.pending.get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Seal the buffered leaves of `topic`
    ///
    /// On failure the leaves go back into the buffer, ahead of anything that
    /// arrived meanwhile. Returns the storage tree id, `None` if nothing was
    /// buffered.
    pub fn seal_topic(&mut self, trail: &AuditTrail, topic: &str) -> AuditResult<Option<i64>> {
        let leaves = match self.pending.remove(topic) {
            Some(leaves) if !leaves.is_empty() => leaves,
            _ => return Ok(None),
        };

        match trail.seal_batch(topic, leaves.clone()) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                log::warn!(
                    "⚠️  Sealing failed for topic {}, keeping {} leaves for next cycle: {}",
                    topic,
                    leaves.len(),
                    e
                );
                let mut restored = leaves;
                if let Some(newer) = self.pending.remove(topic) {
                    restored.extend(newer);
                }
                self.pending.insert(topic.to_string(), restored);
                Err(e)
            }
        }
    }

    /// Seal every topic with buffered leaves; returns the number of trees written
    pub fn seal_all(&mut self, trail: &AuditTrail) -> usize {
        let mut topics: Vec<String> = self.pending.keys().cloned().collect();
        topics.sort();

        let mut sealed = 0;
        for topic in topics {
            match self.seal_topic(trail, &topic) {
                Ok(Some(_)) => sealed += 1,
                Ok(None) => {}
                Err(e) => log::error!("❌ Failed to seal topic {}: {}", topic, e),
            }
        }
        sealed
    }
}

/// Start audit ingestion from the raw content channel
///
/// Main loop:
/// 1. Receives raw content via mpsc channel and buffers it per topic
/// 2. Seals a topic as soon as its buffer reaches `max_leaves`
/// 3. Periodically seals every topic with pending leaves
///
/// Runs until the channel is closed, then seals whatever is left.
pub async fn start_audit_ingestion(
    mut rx: mpsc::Receiver<RawContent>,
    trail: Arc<AuditTrail>,
    seal_interval_ms: u64,
    max_leaves: usize,
) {
    log::info!("🚀 Starting audit ingestion");
    log::info!("   ├─ Seal interval: {}ms", seal_interval_ms);
    log::info!("   └─ Max leaves per storage tree: {}", max_leaves);

    let period = Duration::from_millis(seal_interval_ms);
    // First seal one full period after startup
    let mut seal_timer = interval_at(Instant::now() + period, period);
    let mut buffer = SealBuffer::new(max_leaves);
    let mut received = 0u64;

    loop {
        tokio::select! {
            received_content = rx.recv() => {
                let Some(content) = received_content else {
                    log::warn!("⚠️  Content channel closed, stopping ingestion");
                    let sealed = buffer.seal_all(&trail);
                    log::info!("✅ Final seal complete ({} storage trees)", sealed);
                    break;
                };

                let topic = content.topic.clone();
                received += 1;

                if buffer.push(content) {
                    log::debug!("Leaf threshold reached for topic {}, sealing early", topic);
                    if let Err(e) = buffer.seal_topic(&trail, &topic) {
                        log::error!("❌ Early seal failed for topic {}: {}", topic, e);
                    }
                }
            }

            _ = seal_timer.tick() => {
                let pending = buffer.total_pending();
                if pending == 0 {
                    continue;
                }

                let sealed = buffer.seal_all(&trail);
                log::info!(
                    "📊 Seal cycle: {} storage trees from {} leaves | received: {} | channel backlog: {}",
                    sealed,
                    pending,
                    received,
                    rx.len()
                );
            }
        }
    }

    log::info!("✅ Audit ingestion stopped");
}
