//! Storage tree builder and storage table reads
//!
//! Sealing turns a batch of raw leaves into one storage tree:
//! 1. take a build time from the id clock, holding the commit order lock
//! 2. give leaf `i` the id `<buildTime>.<i>`
//! 3. tag the record with the min/max leaf timestamps (`firstDate`/`lastDate`)
//! 4. write the serialized tree keyed at the build time and flush, then release
//!
//! `(topic, buildTime, firstDate, lastDate)` identifies a storage tree even
//! when two writers in different processes seal at the same instant.

use super::gateway::{AuditPoint, AuditRecord, RecordCursor, Table, TagFilter};
use super::trail::{datetime_to_nanos, now_nanos, nanos_to_datetime, AuditTrail};
use crate::error::{AuditError, AuditResult};
use crate::merkle::{MerkleTree, StorageBucket};
use chrono::{DateTime, Utc};
use std::fmt;

/// Raw content waiting to be sealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLeaf {
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl RawLeaf {
    pub fn new(payload: impl Into<Vec<u8>>, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
        }
    }
}

/// Full identity of a storage tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageTreeKey {
    pub build_time: i64,
    pub first_date: i64,
    pub last_date: i64,
}

impl fmt::Display for StorageTreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.build_time, self.first_date, self.last_date)
    }
}

#[derive(Debug, Clone)]
pub struct StorageTree {
    /// Build time in Unix nanoseconds, the record's time key
    pub id: i64,
    pub topic: String,
    pub first_date: i64,
    pub last_date: i64,
    pub tree: MerkleTree<StorageBucket>,
}

impl StorageTree {
    pub fn key(&self) -> StorageTreeKey {
        StorageTreeKey {
            build_time: self.id,
            first_date: self.first_date,
            last_date: self.last_date,
        }
    }

    pub fn build_time(&self) -> DateTime<Utc> {
        nanos_to_datetime(self.id)
    }

    fn from_record(record: &AuditRecord) -> AuditResult<Self> {
        let tag_nanos = |key: &str| -> AuditResult<i64> {
            record
                .tag(key)
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(|| malformed(record, key))
        };

        let value = record.field("value").ok_or_else(|| malformed(record, "value"))?;

        Ok(Self {
            id: record.time,
            topic: record.tag("topic").unwrap_or_default().to_string(),
            first_date: tag_nanos("firstDate")?,
            last_date: tag_nanos("lastDate")?,
            tree: serde_json::from_str(value)?,
        })
    }
}

fn malformed(record: &AuditRecord, key: &str) -> AuditError {
    AuditError::Persistence(format!(
        "malformed storage record at {}: missing or invalid '{}'",
        record.time, key
    ))
}

fn topic_filter(topic: &str) -> TagFilter {
    TagFilter::new().tag("topic", topic)
}

/// Payloads of every leaf bucket, in leaf order
pub fn read_storage_tree(tree: &MerkleTree<StorageBucket>) -> Vec<Vec<u8>> {
    tree.leaves()
        .iter()
        .map(|bucket| bucket.read_content().to_vec())
        .collect()
}

impl AuditTrail {
    /// Seal `leaves` into a storage tree for `topic` and persist it
    ///
    /// Returns the tree's build time, which is also its identifier.
    pub fn seal_batch(&self, topic: &str, leaves: Vec<RawLeaf>) -> AuditResult<i64> {
        if topic.is_empty() {
            return Err(AuditError::Construction(
                "storage trees need a topic".to_string(),
            ));
        }
        if leaves.is_empty() {
            return Err(AuditError::Construction(format!(
                "no leaves to seal for topic {}",
                topic
            )));
        }

        let (build_time, leaf_count, root) = self.with_next_id(|build_time| {
            let mut first_date = i64::MAX;
            let mut last_date = i64::MIN;
            let buckets: Vec<StorageBucket> = leaves
                .into_iter()
                .enumerate()
                .map(|(i, leaf)| {
                    let ts = datetime_to_nanos(leaf.timestamp);
                    first_date = first_date.min(ts);
                    last_date = last_date.max(ts);

                    let mut bucket = StorageBucket::new(leaf.payload, leaf.timestamp);
                    bucket.id = format!("{}.{}", build_time, i);
                    bucket
                })
                .collect();

            let leaf_count = buckets.len();
            let tree = MerkleTree::build(buckets)?;

            let point = AuditPoint::new(Table::Storage, build_time)
                .with_tag("topic", topic)
                .with_tag("firstDate", first_date.to_string())
                .with_tag("lastDate", last_date.to_string())
                .with_field("value", serde_json::to_string(&tree)?);

            self.write_durable(point)?;
            Ok((build_time, leaf_count, tree.root()))
        })?;

        log::info!(
            "🌳 Storage tree {} sealed for topic {} ({} leaves, root {})",
            build_time,
            topic,
            leaf_count,
            root
        );
        Ok(build_time)
    }

    /// Earliest storage tree of `topic` strictly after `cursor`
    ///
    /// Pages in `(time, seq)` order, so trees sharing a build time are each
    /// returned once.
    pub(crate) fn storage_tree_page(
        &self,
        topic: &str,
        cursor: RecordCursor,
    ) -> AuditResult<Option<(StorageTree, RecordCursor)>> {
        let page = self
            .gateway
            .page_after(Table::Storage, &topic_filter(topic), cursor, 1)?;
        match page.first() {
            Some(record) => Ok(Some((StorageTree::from_record(record)?, record.cursor()))),
            None => Ok(None),
        }
    }

    /// First storage tree of `topic` built strictly after `time_lower`
    pub fn storage_tree_after(
        &self,
        topic: &str,
        time_lower: DateTime<Utc>,
    ) -> AuditResult<Option<StorageTree>> {
        self.gateway
            .earliest_after(Table::Storage, &topic_filter(topic), datetime_to_nanos(time_lower))?
            .map(|record| StorageTree::from_record(&record))
            .transpose()
    }

    /// Storage trees of `topic` built in `(time_init, time_final]`
    ///
    /// Result size grows with the interval; keep it bounded.
    pub fn storage_trees(
        &self,
        topic: &str,
        time_init: DateTime<Utc>,
        time_final: DateTime<Utc>,
    ) -> AuditResult<Vec<StorageTree>> {
        self.gateway
            .range(
                Table::Storage,
                &topic_filter(topic),
                datetime_to_nanos(time_init),
                datetime_to_nanos(time_final),
            )?
            .iter()
            .map(StorageTree::from_record)
            .collect()
    }

    pub fn storage_tree_by_id(&self, topic: &str, id: i64) -> AuditResult<StorageTree> {
        let record = self
            .gateway
            .by_exact_key(Table::Storage, &topic_filter(topic), id)?;
        StorageTree::from_record(&record)
    }

    /// Exact lookup including the date tags
    pub fn storage_tree_by_key(&self, topic: &str, key: StorageTreeKey) -> AuditResult<StorageTree> {
        let filter = topic_filter(topic)
            .tag("firstDate", key.first_date.to_string())
            .tag("lastDate", key.last_date.to_string());
        let record = self
            .gateway
            .by_exact_key(Table::Storage, &filter, key.build_time)?;
        StorageTree::from_record(&record)
    }

    /// Highest storage tree id of `topic`; now for an empty store
    pub fn last_storage_id(&self, topic: &str) -> AuditResult<i64> {
        match self.gateway.latest(Table::Storage, &topic_filter(topic))? {
            Some(record) => Ok(record.time),
            None => {
                log::debug!("No storage trees for topic {} yet, starting from now", topic);
                Ok(now_nanos())
            }
        }
    }
}
