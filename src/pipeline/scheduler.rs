//! Daily pooling scheduler
//!
//! Each cycle walks the hierarchy bottom-up: level 2 per topic, then level 1,
//! then the level 0 root. A level that has nothing new to pool writes no tree.

use crate::audit_core::{AuditTrail, Level};
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant};

/// Trees written by one pooling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolingReport {
    /// `(topic, tree id)` of every level 2 tree
    pub topic_trees: Vec<(String, i64)>,
    pub mid_tree: Option<i64>,
    pub root_tree: Option<i64>,
    pub failures: usize,
}

impl PoolingReport {
    pub fn trees_written(&self) -> usize {
        self.topic_trees.len() + self.mid_tree.iter().count() + self.root_tree.iter().count()
    }
}

fn pool_logged(trail: &AuditTrail, level: Level, topic: &str, failures: &mut usize) -> Option<i64> {
    match trail.pool_pending(level, topic) {
        Ok(id) => id,
        Err(e) => {
            log::error!("❌ Pooling failed at level {} (topic '{}'): {}", level, topic, e);
            *failures += 1;
            None
        }
    }
}

/// Run one pooling cycle over `topics`
pub fn run_pooling_cycle(trail: &AuditTrail, topics: &[String]) -> PoolingReport {
    let mut report = PoolingReport::default();

    for level in Level::POOLING_ORDER {
        match level {
            Level::Topic => {
                for topic in topics {
                    if let Some(id) = pool_logged(trail, level, topic, &mut report.failures) {
                        report.topic_trees.push((topic.clone(), id));
                    }
                }
            }
            Level::Mid => report.mid_tree = pool_logged(trail, level, "", &mut report.failures),
            Level::Root => report.root_tree = pool_logged(trail, level, "", &mut report.failures),
        }
    }

    report
}

/// Pooling scheduler task - periodically pools the hierarchy
///
/// Arguments:
/// - `trail`: Shared audit trail
/// - `topics`: Topics pooled at level 2
/// - `pool_interval_ms`: Pooling interval in milliseconds
///
/// This function runs indefinitely until cancelled.
pub async fn pooling_scheduler_task(
    trail: Arc<AuditTrail>,
    topics: Vec<String>,
    pool_interval_ms: u64,
) {
    log::info!(
        "⏰ Starting pooling scheduler (interval: {}ms, topics: {:?})",
        pool_interval_ms,
        topics
    );

    let period = Duration::from_millis(pool_interval_ms);
    let mut timer = interval_at(Instant::now() + period, period);

    loop {
        timer.tick().await;

        let started = std::time::Instant::now();
        let report = run_pooling_cycle(&trail, &topics);

        if report.trees_written() > 0 || report.failures > 0 {
            log::info!(
                "📊 Pooling cycle: {} level-2 trees | level 1: {:?} | root: {:?} | failures: {} | {}ms",
                report.topic_trees.len(),
                report.mid_tree,
                report.root_tree,
                report.failures,
                started.elapsed().as_millis()
            );
        } else {
            log::debug!("Pooling cycle: nothing new to pool");
        }
    }
}
