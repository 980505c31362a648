//! Hierarchical aggregation into daily trees
//!
//! One pooling algorithm serves every level:
//! - level 2 pools storage tree ids of one topic
//! - level 1 pools level-2 ids across topics
//! - level 0 pools level-1 ids (root of the day)
//!
//! Daily tree records live in the `merkle` table, keyed by the tree id and
//! tagged `(topic, level, id)`. Only level 2 updates the reverse pool index.

use super::gateway::{AuditPoint, AuditRecord, RecordCursor, RecordWalk, Table, TagFilter};
use super::pool_index::CacheLookup;
use super::trail::{datetime_to_nanos, now_nanos, nanos_to_datetime, AuditTrail};
use crate::error::{AuditError, AuditResult};
use crate::merkle::{MerkleTree, PoolId};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Root = 0,
    Mid = 1,
    Topic = 2,
}

impl Level {
    /// Levels in pooling order, bottom-up
    pub const POOLING_ORDER: [Level; 3] = [Level::Topic, Level::Mid, Level::Root];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Level> {
        match value {
            0 => Some(Level::Root),
            1 => Some(Level::Mid),
            2 => Some(Level::Topic),
            _ => None,
        }
    }

    /// Daily level pooled into this one; `None` when children are storage trees
    pub fn child_level(self) -> Option<Level> {
        match self {
            Level::Root => Some(Level::Mid),
            Level::Mid => Some(Level::Topic),
            Level::Topic => None,
        }
    }

    fn tag(self) -> String {
        self.as_u8().to_string()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone)]
pub struct DailyTree {
    pub id: i64,
    pub level: Level,
    /// Empty below level 2
    pub topic: String,
    pub children: Vec<String>,
    /// Youngest storage tree covered, level 2 only
    pub last_timestamp: Option<i64>,
    pub tree: MerkleTree<PoolId>,
}

impl DailyTree {
    fn from_record(record: &AuditRecord) -> AuditResult<Self> {
        let level = record
            .tag("level")
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(Level::from_u8)
            .ok_or_else(|| malformed(record, "level"))?;
        let value = record.field("value").ok_or_else(|| malformed(record, "value"))?;
        let children = record
            .field("children")
            .ok_or_else(|| malformed(record, "children"))?;
        let last_timestamp = match record.field("lastTimestamp") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| malformed(record, "lastTimestamp"))?,
            ),
            None => None,
        };

        Ok(Self {
            id: record.time,
            level,
            topic: record.tag("topic").unwrap_or_default().to_string(),
            children: serde_json::from_str(children)?,
            last_timestamp,
            tree: serde_json::from_str(value)?,
        })
    }

    /// Highest numeric child id; children that do not parse are skipped
    pub fn youngest_child(&self) -> Option<i64> {
        self.children.iter().filter_map(|c| parse_child_time(c)).max()
    }
}

fn malformed(record: &AuditRecord, key: &str) -> AuditError {
    AuditError::Persistence(format!(
        "malformed daily tree record at {}: missing or invalid '{}'",
        record.time, key
    ))
}

fn level_filter(topic: &str, level: Level) -> TagFilter {
    TagFilter::new().tag("topic", topic).tag("level", level.tag())
}

/// Time prefix of a child id (`<nanos>` or `<nanos>.<index>`)
fn parse_child_time(child_id: &str) -> Option<i64> {
    child_id.split('.').next()?.parse::<i64>().ok()
}

impl AuditTrail {
    /// Pool `child_ids` into a daily tree with id `parent_id`
    ///
    /// The tree is durable before the pool index learns about it, so a cached
    /// parent always exists in the store.
    pub fn pool_children(
        &self,
        level: Level,
        topic: &str,
        parent_id: i64,
        child_ids: &[String],
        last_timestamp: Option<DateTime<Utc>>,
    ) -> AuditResult<()> {
        match level {
            Level::Topic if topic.is_empty() => {
                return Err(AuditError::Construction(
                    "level 2 daily trees need a topic".to_string(),
                ))
            }
            Level::Root | Level::Mid if !topic.is_empty() => {
                return Err(AuditError::Construction(format!(
                    "level {} daily trees are not topic scoped (got '{}')",
                    level, topic
                )))
            }
            _ => {}
        }

        let tree = MerkleTree::build(child_ids.iter().map(PoolId::new).collect())?;

        let mut point = AuditPoint::new(Table::Merkle, parent_id)
            .with_tag("topic", topic)
            .with_tag("level", level.tag())
            .with_tag("id", parent_id.to_string())
            .with_field("value", serde_json::to_string(&tree)?)
            .with_field("children", serde_json::to_string(child_ids)?);
        if level == Level::Topic {
            if let Some(ts) = last_timestamp {
                point = point.with_field("lastTimestamp", datetime_to_nanos(ts).to_string());
            }
        }

        self.write_durable(point)?;

        if level == Level::Topic {
            self.pool_index.record_parents(topic, child_ids, parent_id)?;
        }

        log::info!(
            "🌲 Daily tree {} written (level {}, topic '{}', {} children, root {})",
            parent_id,
            level,
            topic,
            child_ids.len(),
            tree.root()
        );
        Ok(())
    }

    /// Pool every child not yet covered at `level`
    ///
    /// Returns the new tree id, or `None` when there was nothing to pool. The
    /// parent id is taken under the commit order lock, so every child with a
    /// smaller id is already durable when the children are read.
    pub fn pool_pending(&self, level: Level, topic: &str) -> AuditResult<Option<i64>> {
        self.with_next_id(|parent_id| {
            let (child_ids, last_timestamp) = match level.child_level() {
                None => {
                    let cursor = self.last_timestamp(topic, level)?;
                    let trees = self.storage_trees(topic, cursor, nanos_to_datetime(parent_id))?;
                    let youngest = trees.iter().map(|t| t.id).max();
                    let ids: Vec<String> = trees.iter().map(|t| t.id.to_string()).collect();
                    (ids, youngest.map(nanos_to_datetime))
                }
                Some(child_level) => {
                    let cursor = match self.youngest_child(topic, level)? {
                        0 => datetime_to_nanos(Utc::now() - self.options.lookback),
                        youngest => youngest,
                    };
                    let trees = self.level_trees(child_level, cursor, parent_id)?;
                    (trees.iter().map(|t| t.id.to_string()).collect(), None)
                }
            };

            if child_ids.is_empty() {
                log::debug!("Nothing to pool at level {} (topic '{}')", level, topic);
                return Ok(None);
            }

            self.pool_children(level, topic, parent_id, &child_ids, last_timestamp)?;
            Ok(Some(parent_id))
        })
    }

    /// First daily tree at `(topic, level)` with id strictly after `time_lower`
    pub fn daily_tree_after(
        &self,
        topic: &str,
        level: Level,
        time_lower: DateTime<Utc>,
    ) -> AuditResult<Option<DailyTree>> {
        self.gateway
            .earliest_after(
                Table::Merkle,
                &level_filter(topic, level),
                datetime_to_nanos(time_lower),
            )?
            .map(|record| DailyTree::from_record(&record))
            .transpose()
    }

    /// Daily trees at `(topic, level)` with ids in `(time_init, time_final]`
    pub fn daily_trees(
        &self,
        topic: &str,
        level: Level,
        time_init: DateTime<Utc>,
        time_final: DateTime<Utc>,
    ) -> AuditResult<Vec<DailyTree>> {
        self.gateway
            .range(
                Table::Merkle,
                &level_filter(topic, level),
                datetime_to_nanos(time_init),
                datetime_to_nanos(time_final),
            )?
            .iter()
            .map(DailyTree::from_record)
            .collect()
    }

    /// Daily trees at `level` across every topic, ids in `(lower, upper]`
    pub fn level_trees(&self, level: Level, lower: i64, upper: i64) -> AuditResult<Vec<DailyTree>> {
        let filter = TagFilter::new().tag("level", level.tag());
        self.gateway
            .range(Table::Merkle, &filter, lower, upper)?
            .iter()
            .map(DailyTree::from_record)
            .collect()
    }

    pub fn daily_tree_by_id(&self, topic: &str, level: Level, id: i64) -> AuditResult<DailyTree> {
        let record = self
            .gateway
            .by_exact_key(Table::Merkle, &level_filter(topic, level), id)?;
        DailyTree::from_record(&record)
    }

    /// Pooling cursor of `(topic, level)`
    ///
    /// The `lastTimestamp` of the latest tree, its id when the field is absent,
    /// and `now - lookback` on an empty store.
    pub fn last_timestamp(&self, topic: &str, level: Level) -> AuditResult<DateTime<Utc>> {
        match self.gateway.latest(Table::Merkle, &level_filter(topic, level))? {
            Some(record) => {
                let tree = DailyTree::from_record(&record)?;
                Ok(nanos_to_datetime(tree.last_timestamp.unwrap_or(tree.id)))
            }
            None => {
                log::debug!(
                    "No level {} trees for topic '{}', looking back {} days",
                    level,
                    topic,
                    self.options.lookback.num_days()
                );
                Ok(Utc::now() - self.options.lookback)
            }
        }
    }

    /// Highest daily tree id at `(topic, level)`; now for an empty store
    pub fn last_daily_id(&self, topic: &str, level: Level) -> AuditResult<i64> {
        match self.gateway.latest(Table::Merkle, &level_filter(topic, level))? {
            Some(record) => Ok(record.time),
            None => Ok(now_nanos()),
        }
    }

    /// Youngest child pooled by the latest tree at `(topic, level)`; 0 if none
    pub fn youngest_child(&self, topic: &str, level: Level) -> AuditResult<i64> {
        match self.gateway.latest(Table::Merkle, &level_filter(topic, level))? {
            Some(record) => Ok(DailyTree::from_record(&record)?.youngest_child().unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Level-2 parent of `child_id` under `topic`
    ///
    /// Answers from the pool index when it can. On a miss the level-2 records
    /// are scanned, and a parent found there is written back to the index.
    pub fn find_parent(&self, topic: &str, child_id: &str) -> AuditResult<i64> {
        if let CacheLookup::Hit(parent) = self.pool_index.lookup_parent(topic, child_id)? {
            return Ok(parent);
        }

        log::debug!(
            "Pool index miss for {} ({}), scanning level 2 trees",
            child_id,
            topic
        );

        // Parent ids are chosen by the caller and may sort before the child
        let walk = RecordWalk::new(
            self.gateway.as_ref(),
            Table::Merkle,
            level_filter(topic, Level::Topic),
            RecordCursor::start(),
            self.options.walk_page_size,
        );

        for record in walk {
            let tree = DailyTree::from_record(&record?)?;
            if tree.children.iter().any(|c| c == child_id) {
                self.pool_index.record_parents(topic, &tree.children, tree.id)?;
                log::info!("🔧 Pool index repaired for {} -> {}", child_id, tree.id);
                return Ok(tree.id);
            }
        }

        Err(AuditError::NotFound(format!(
            "no level 2 parent for {} in topic {}",
            child_id, topic
        )))
    }

    /// Rebuild the pool index of `topic` from the level-2 records
    ///
    /// Returns the number of `(child, parent)` pairs written.
    pub fn rebuild_pool_index(&self, topic: &str) -> AuditResult<usize> {
        let mut pools = RecordWalk::new(
            self.gateway.as_ref(),
            Table::Merkle,
            level_filter(topic, Level::Topic),
            RecordCursor::start(),
            self.options.walk_page_size,
        )
        .map(|record| -> AuditResult<(Vec<String>, i64)> {
            let tree = DailyTree::from_record(&record?)?;
            Ok((tree.children, tree.id))
        });

        self.pool_index.clear_topic(topic)?;
        let written = self.pool_index.rebuild_from(topic, &mut pools)?;
        log::info!("✅ Pool index rebuilt for topic {} ({} entries)", topic, written);
        Ok(written)
    }
}
