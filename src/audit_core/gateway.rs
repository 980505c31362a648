//! Persistence gateway over the audit time-series store
//!
//! Two logical tables live in the audit namespace:
//! - `storage` - one row per storage tree, tags `topic/firstDate/lastDate`,
//!   keyed by build time
//! - `merkle` - one row per daily tree, tags `topic/level/id`
//!
//! Rows are points: a nanosecond time key, string tags used for filtering, and
//! string fields holding the serialized tree and metadata.
//!
//! Query contract:
//! - "nothing matched" is `Ok(None)` / an empty `Vec`, never an error
//! - `by_exact_key` is a key lookup and answers `NotFound` on a miss
//! - store failures surface as `AuditError::Persistence`

use crate::error::AuditResult;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Storage,
    Merkle,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Storage => "storage",
            Table::Merkle => "merkle",
        }
    }
}

/// Tag equality filter; every listed tag must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    tags: Vec<(String, String)>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.push((key.to_string(), value.into()));
        self
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.tags
            .iter()
            .all(|(k, v)| tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}

/// Point destined for the store, accumulated in the batch buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPoint {
    pub table: Table,
    pub time: i64,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl AuditPoint {
    pub fn new(table: Table, time: i64) -> Self {
        Self {
            table,
            time,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Durable row read back from the store
///
/// `seq` is the store's insertion sequence and breaks ties between rows that
/// share a time key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub seq: i64,
    pub time: i64,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn cursor(&self) -> RecordCursor {
        RecordCursor {
            time: self.time,
            seq: self.seq,
        }
    }
}

/// Keyset position `(time, seq)` for paging through a table in time order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordCursor {
    pub time: i64,
    pub seq: i64,
}

impl RecordCursor {
    /// Cursor positioned before every record with time greater than `time`
    pub fn after_time(time: i64) -> Self {
        Self {
            time,
            seq: i64::MAX,
        }
    }

    pub fn start() -> Self {
        Self {
            time: i64::MIN,
            seq: i64::MIN,
        }
    }
}

/// Write side of the store: a whole batch of points, all or nothing
pub trait PointSink: Send + Sync {
    fn write_points(&self, points: &[AuditPoint]) -> AuditResult<()>;
}

/// Read side of the store
pub trait PersistenceGateway: Send + Sync {
    /// Oldest record matching `filter` with time strictly greater than `time_lower`
    fn earliest_after(
        &self,
        table: Table,
        filter: &TagFilter,
        time_lower: i64,
    ) -> AuditResult<Option<AuditRecord>>;

    /// Records with `time_lower < time <= time_upper`, oldest first
    ///
    /// Unbounded in result size; callers bound the interval.
    fn range(
        &self,
        table: Table,
        filter: &TagFilter,
        time_lower: i64,
        time_upper: i64,
    ) -> AuditResult<Vec<AuditRecord>>;

    /// Record with time equal to `key`; the first written wins on duplicates
    fn by_exact_key(&self, table: Table, filter: &TagFilter, key: i64) -> AuditResult<AuditRecord>;

    /// Newest record matching `filter`
    fn latest(&self, table: Table, filter: &TagFilter) -> AuditResult<Option<AuditRecord>>;

    /// Up to `limit` records strictly after `cursor` in `(time, seq)` order
    fn page_after(
        &self,
        table: Table,
        filter: &TagFilter,
        cursor: RecordCursor,
        limit: usize,
    ) -> AuditResult<Vec<AuditRecord>>;
}

/// Iterator walking every record matching a filter in `(time, seq)` order
///
/// Reads the table one bounded page at a time, so memory stays flat no matter
/// how many records the table holds.
pub struct RecordWalk<'a> {
    gateway: &'a dyn PersistenceGateway,
    table: Table,
    filter: TagFilter,
    cursor: RecordCursor,
    page_size: usize,
    page: std::vec::IntoIter<AuditRecord>,
    exhausted: bool,
}

impl<'a> RecordWalk<'a> {
    pub fn new(
        gateway: &'a dyn PersistenceGateway,
        table: Table,
        filter: TagFilter,
        cursor: RecordCursor,
        page_size: usize,
    ) -> Self {
        Self {
            gateway,
            table,
            filter,
            cursor,
            page_size: page_size.max(1),
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }
}

impl<'a> Iterator for RecordWalk<'a> {
    type Item = AuditResult<AuditRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.page.next() {
                self.cursor = record.cursor();
                return Some(Ok(record));
            }
            if self.exhausted {
                return None;
            }

            match self
                .gateway
                .page_after(self.table, &self.filter, self.cursor, self.page_size)
            {
                Ok(records) => {
                    if records.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if records.is_empty() {
                        return None;
                    }
                    self.page = records.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_filter_matches() {
        let mut tags = BTreeMap::new();
        tags.insert("topic".to_string(), "prices".to_string());
        tags.insert("level".to_string(), "2".to_string());

        assert!(TagFilter::new().matches(&tags));
        assert!(TagFilter::new().tag("topic", "prices").matches(&tags));
        assert!(TagFilter::new()
            .tag("topic", "prices")
            .tag("level", "2")
            .matches(&tags));
        assert!(!TagFilter::new().tag("topic", "volumes").matches(&tags));
        assert!(!TagFilter::new().tag("id", "5").matches(&tags));
    }

    #[test]
    fn test_cursor_ordering() {
        let a = RecordCursor { time: 10, seq: 3 };
        let b = RecordCursor { time: 10, seq: 4 };
        let c = RecordCursor { time: 11, seq: 1 };
        assert!(a < b && b < c);
        assert!(RecordCursor::after_time(10) > b);
        assert!(RecordCursor::after_time(10) < c);
    }
}
