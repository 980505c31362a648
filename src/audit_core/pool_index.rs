//! Reverse pool index: child identifier -> parent daily tree id, per topic
//!
//! The index only accelerates parent lookups. The level-2 records in the
//! `merkle` table are the source of truth, so:
//! - a `Miss` means "not cached", never "no parent"
//! - the whole index can be rebuilt from those records at any time
//!
//! Lookups and rebuilds are separate code paths: `lookup_parent` answers from
//! the cache only, `rebuild_from` replays durable records into it.

use crate::error::{AuditError, AuditResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

/// Namespace (hash key) holding the pool map of one topic
pub fn pool_namespace(topic: &str) -> String {
    format!("HashedPoolsMap_{}", topic)
}

/// Result of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(i64),
    /// Not cached; consult the durable records
    Miss,
}

pub trait PoolIndex: Send + Sync {
    /// Map every child to `parent_id` under `topic`
    fn record_parents(&self, topic: &str, children: &[String], parent_id: i64) -> AuditResult<()>;

    fn lookup_parent(&self, topic: &str, child_id: &str) -> AuditResult<CacheLookup>;

    /// Every cached pair of a topic
    fn entries(&self, topic: &str) -> AuditResult<BTreeMap<String, i64>>;

    /// Drop every cached pair of a topic
    fn clear_topic(&self, topic: &str) -> AuditResult<()>;

    fn backend_type(&self) -> &'static str;

    fn record_parent(&self, topic: &str, child_id: &str, parent_id: i64) -> AuditResult<()> {
        self.record_parents(topic, &[child_id.to_string()], parent_id)
    }

    /// Replay `(children, parent)` pairs from the source of truth
    ///
    /// Idempotent and order independent. Returns the number of pairs written.
    fn rebuild_from(
        &self,
        topic: &str,
        pools: &mut dyn Iterator<Item = AuditResult<(Vec<String>, i64)>>,
    ) -> AuditResult<usize> {
        let mut written = 0;
        for pool in pools {
            let (children, parent_id) = pool?;
            self.record_parents(topic, &children, parent_id)?;
            written += children.len();
        }
        Ok(written)
    }
}

fn parse_parent(value: &str) -> AuditResult<i64> {
    value.parse::<i64>().map_err(|e| {
        AuditError::Persistence(format!("invalid parent id '{}' in pool index: {}", value, e))
    })
}

/// In-process pool index
#[derive(Default)]
pub struct MemoryPoolIndex {
    maps: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryPoolIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> AuditError {
    AuditError::Persistence("pool index lock poisoned".to_string())
}

impl PoolIndex for MemoryPoolIndex {
    fn record_parents(&self, topic: &str, children: &[String], parent_id: i64) -> AuditResult<()> {
        let mut maps = self.maps.write().map_err(|_| poisoned())?;
        let map = maps.entry(pool_namespace(topic)).or_default();
        for child in children {
            map.insert(child.clone(), parent_id.to_string());
        }
        Ok(())
    }

    fn lookup_parent(&self, topic: &str, child_id: &str) -> AuditResult<CacheLookup> {
        let maps = self.maps.read().map_err(|_| poisoned())?;
        match maps.get(&pool_namespace(topic)).and_then(|m| m.get(child_id)) {
            Some(value) => Ok(CacheLookup::Hit(parse_parent(value)?)),
            None => Ok(CacheLookup::Miss),
        }
    }

    fn entries(&self, topic: &str) -> AuditResult<BTreeMap<String, i64>> {
        let maps = self.maps.read().map_err(|_| poisoned())?;
        let mut entries = BTreeMap::new();
        if let Some(map) = maps.get(&pool_namespace(topic)) {
            for (child, parent) in map {
                entries.insert(child.clone(), parse_parent(parent)?);
            }
        }
        Ok(entries)
    }

    fn clear_topic(&self, topic: &str) -> AuditResult<()> {
        let mut maps = self.maps.write().map_err(|_| poisoned())?;
        maps.remove(&pool_namespace(topic));
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Pool index kept in its own SQLite file as `(namespace, field, value)` rows
pub struct SqlitePoolIndex {
    conn: Mutex<Connection>,
}

impl SqlitePoolIndex {
    pub fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        super::sqlite_gateway::apply_pragmas(&conn)?;
        Self::init(conn)
    }

    pub fn in_memory() -> AuditResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AuditResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pool_index (
                namespace TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, field)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AuditResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| poisoned())
    }
}

impl PoolIndex for SqlitePoolIndex {
    fn record_parents(&self, topic: &str, children: &[String], parent_id: i64) -> AuditResult<()> {
        let namespace = pool_namespace(topic);
        let value = parent_id.to_string();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for child in children {
            tx.execute(
                "INSERT OR REPLACE INTO pool_index (namespace, field, value) VALUES (?1, ?2, ?3)",
                params![namespace, child, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn lookup_parent(&self, topic: &str, child_id: &str) -> AuditResult<CacheLookup> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM pool_index WHERE namespace = ?1 AND field = ?2",
                params![pool_namespace(topic), child_id],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(value) => Ok(CacheLookup::Hit(parse_parent(&value)?)),
            None => Ok(CacheLookup::Miss),
        }
    }

    fn entries(&self, topic: &str) -> AuditResult<BTreeMap<String, i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT field, value FROM pool_index WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![pool_namespace(topic)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let (field, value) = row?;
            entries.insert(field, parse_parent(&value)?);
        }
        Ok(entries)
    }

    fn clear_topic(&self, topic: &str) -> AuditResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pool_index WHERE namespace = ?1",
            params![pool_namespace(topic)],
        )?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn children(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn check_record_and_lookup(index: &dyn PoolIndex) {
        index
            .record_parents("prices", &children(&["100.0", "100.1", "100.2"]), 500)
            .unwrap();

        assert_eq!(index.lookup_parent("prices", "100.1").unwrap(), CacheLookup::Hit(500));
        // Scoped by topic
        assert_eq!(index.lookup_parent("volumes", "100.1").unwrap(), CacheLookup::Miss);
        assert_eq!(index.lookup_parent("prices", "999").unwrap(), CacheLookup::Miss);
    }

    #[test]
    fn test_memory_record_and_lookup() {
        check_record_and_lookup(&MemoryPoolIndex::new());
    }

    #[test]
    fn test_sqlite_record_and_lookup() {
        check_record_and_lookup(&SqlitePoolIndex::in_memory().unwrap());
    }

    #[test]
    fn test_rebuild_matches_incremental_and_is_idempotent() {
        let pools = vec![
            (children(&["1", "2"]), 10),
            (children(&["3"]), 20),
            (children(&["4", "5", "6"]), 30),
        ];

        let incremental = MemoryPoolIndex::new();
        for (kids, parent) in &pools {
            incremental.record_parents("prices", kids, *parent).unwrap();
        }

        let rebuilt = SqlitePoolIndex::in_memory().unwrap();
        // Reverse order, replayed twice
        for _ in 0..2 {
            let mut replay = pools.iter().rev().cloned().map(Ok::<_, AuditError>);
            let written = rebuilt.rebuild_from("prices", &mut replay).unwrap();
            assert_eq!(written, 6);
        }

        assert_eq!(
            rebuilt.entries("prices").unwrap(),
            incremental.entries("prices").unwrap()
        );
    }

    #[test]
    fn test_rebuild_stops_on_source_error() {
        let index = MemoryPoolIndex::new();
        let mut replay = vec![
            Ok((children(&["1"]), 10)),
            Err(AuditError::Persistence("store down".to_string())),
            Ok((children(&["2"]), 20)),
        ]
        .into_iter();

        assert!(index.rebuild_from("prices", &mut replay).is_err());
        assert_eq!(index.lookup_parent("prices", "1").unwrap(), CacheLookup::Hit(10));
        assert_eq!(index.lookup_parent("prices", "2").unwrap(), CacheLookup::Miss);
    }

    #[test]
    fn test_clear_topic() {
        let index = SqlitePoolIndex::in_memory().unwrap();
        index.record_parent("prices", "1", 10).unwrap();
        index.record_parent("volumes", "1", 11).unwrap();

        index.clear_topic("prices").unwrap();
        assert!(index.entries("prices").unwrap().is_empty());
        assert_eq!(index.lookup_parent("volumes", "1").unwrap(), CacheLookup::Hit(11));
    }

    #[test]
    fn test_values_stored_as_decimal_strings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool_index.db");
        let index = SqlitePoolIndex::open(&path).unwrap();
        index.record_parent("prices", "100.1", 1_700_000_000_000_000_000).unwrap();
        drop(index);

        let conn = Connection::open(&path).unwrap();
        let (namespace, value): (String, String) = conn
            .query_row(
                "SELECT namespace, value FROM pool_index WHERE field = '100.1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(namespace, "HashedPoolsMap_prices");
        assert_eq!(value, "1700000000000000000");
    }
}
