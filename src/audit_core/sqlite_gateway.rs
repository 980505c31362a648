//! SQLite-backed time-series store for the audit namespace
//!
//! Each logical table is an append-only list of points:
//!
//! ```text
//! seq INTEGER PRIMARY KEY AUTOINCREMENT   insertion order, tie breaker
//! time INTEGER NOT NULL                   nanosecond time key
//! tags TEXT NOT NULL                      JSON object, filtered with json_extract
//! fields TEXT NOT NULL                    JSON object
//! ```

use super::gateway::{
    AuditPoint, AuditRecord, PersistenceGateway, PointSink, RecordCursor, Table, TagFilter,
};
use crate::error::{AuditError, AuditResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const TABLES: [Table; 2] = [Table::Storage, Table::Merkle];

/// Apply the PRAGMAs used by every audit database connection
///
/// WAL journal, NORMAL sync, in-memory temp store, checkpoint every 1000 pages.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    Ok(())
}

pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    /// Open (or create) the audit database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> AuditResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuditError::Persistence(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;

        log::info!("✅ Audit store initialized: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory store, gone when dropped
    pub fn in_memory() -> AuditResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        for table in TABLES {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    time INTEGER NOT NULL,
                    tags TEXT NOT NULL,
                    fields TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{t}_time ON {t}(time, seq);",
                t = table.as_str()
            ))?;
        }
        Ok(())
    }

    fn lock(&self) -> AuditResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Persistence("audit store connection lock poisoned".to_string()))
    }

    /// Run a filtered SELECT; `extra` is appended to the WHERE clause
    fn select(
        &self,
        table: Table,
        filter: &TagFilter,
        extra: &str,
        extra_params: Vec<Value>,
        order: &str,
        limit: Option<usize>,
    ) -> AuditResult<Vec<AuditRecord>> {
        let mut sql = format!(
            "SELECT seq, time, tags, fields FROM {} WHERE 1 = 1",
            table.as_str()
        );
        let mut values: Vec<Value> = Vec::new();

        for (key, value) in filter.tags() {
            sql.push_str(" AND json_extract(tags, ?) = ?");
            values.push(Value::Text(format!("$.\"{}\"", key)));
            values.push(Value::Text(value.clone()));
        }
        if !extra.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(extra);
            values.extend(extra_params);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (seq, time, tags, fields) = row?;
            records.push(AuditRecord {
                seq,
                time,
                tags: serde_json::from_str::<BTreeMap<String, String>>(&tags)?,
                fields: serde_json::from_str::<BTreeMap<String, String>>(&fields)?,
            });
        }
        Ok(records)
    }
}

impl PointSink for SqliteGateway {
    fn write_points(&self, points: &[AuditPoint]) -> AuditResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for point in points {
            tx.execute(
                &format!(
                    "INSERT INTO {} (time, tags, fields) VALUES (?1, ?2, ?3)",
                    point.table.as_str()
                ),
                params![
                    point.time,
                    serde_json::to_string(&point.tags)?,
                    serde_json::to_string(&point.fields)?,
                ],
            )?;
        }

        tx.commit()?;
        log::debug!("✅ Wrote {} audit points", points.len());
        Ok(())
    }
}

impl PersistenceGateway for SqliteGateway {
    fn earliest_after(
        &self,
        table: Table,
        filter: &TagFilter,
        time_lower: i64,
    ) -> AuditResult<Option<AuditRecord>> {
        let mut records = self.select(
            table,
            filter,
            "time > ?",
            vec![Value::Integer(time_lower)],
            "time ASC, seq ASC",
            Some(1),
        )?;
        Ok(records.pop())
    }

    fn range(
        &self,
        table: Table,
        filter: &TagFilter,
        time_lower: i64,
        time_upper: i64,
    ) -> AuditResult<Vec<AuditRecord>> {
        self.select(
            table,
            filter,
            "time > ? AND time <= ?",
            vec![Value::Integer(time_lower), Value::Integer(time_upper)],
            "time ASC, seq ASC",
            None,
        )
    }

    fn by_exact_key(&self, table: Table, filter: &TagFilter, key: i64) -> AuditResult<AuditRecord> {
        let mut records = self.select(
            table,
            filter,
            "time = ?",
            vec![Value::Integer(key)],
            "seq ASC",
            Some(1),
        )?;
        records.pop().ok_or_else(|| {
            AuditError::NotFound(format!("no {} record with key {}", table.as_str(), key))
        })
    }

    fn latest(&self, table: Table, filter: &TagFilter) -> AuditResult<Option<AuditRecord>> {
        let mut records = self.select(table, filter, "", Vec::new(), "time DESC, seq DESC", Some(1))?;
        Ok(records.pop())
    }

    fn page_after(
        &self,
        table: Table,
        filter: &TagFilter,
        cursor: RecordCursor,
        limit: usize,
    ) -> AuditResult<Vec<AuditRecord>> {
        self.select(
            table,
            filter,
            "(time > ? OR (time = ? AND seq > ?))",
            vec![
                Value::Integer(cursor.time),
                Value::Integer(cursor.time),
                Value::Integer(cursor.seq),
            ],
            "time ASC, seq ASC",
            Some(limit),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_core::gateway::RecordWalk;
    use tempfile::tempdir;

    fn storage_point(topic: &str, time: i64) -> AuditPoint {
        AuditPoint::new(Table::Storage, time)
            .with_tag("topic", topic)
            .with_field("value", format!("tree-{}", time))
    }

    #[test]
    fn test_write_and_read_back() {
        let gateway = SqliteGateway::in_memory().unwrap();
        gateway
            .write_points(&[storage_point("prices", 100), storage_point("prices", 200)])
            .unwrap();

        let filter = TagFilter::new().tag("topic", "prices");
        let first = gateway.earliest_after(Table::Storage, &filter, 0).unwrap().unwrap();
        assert_eq!(first.time, 100);
        assert_eq!(first.tag("topic"), Some("prices"));
        assert_eq!(first.field("value"), Some("tree-100"));

        let second = gateway.earliest_after(Table::Storage, &filter, 100).unwrap().unwrap();
        assert_eq!(second.time, 200);
    }

    #[test]
    fn test_earliest_after_latest_time_is_empty() {
        let gateway = SqliteGateway::in_memory().unwrap();
        gateway
            .write_points(&[storage_point("prices", 100), storage_point("prices", 300)])
            .unwrap();

        let filter = TagFilter::new().tag("topic", "prices");
        let latest = gateway.latest(Table::Storage, &filter).unwrap().unwrap();
        assert_eq!(latest.time, 300);

        // Steady state of a polling consumer: empty, not an error
        let next = gateway.earliest_after(Table::Storage, &filter, latest.time).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_empty_store_answers_empty() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let filter = TagFilter::new().tag("topic", "prices").tag("level", "2");

        assert!(gateway.latest(Table::Merkle, &filter).unwrap().is_none());
        assert!(gateway.earliest_after(Table::Merkle, &filter, 0).unwrap().is_none());
        assert!(gateway.range(Table::Merkle, &filter, 0, i64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_range_bounds_and_topic_filter() {
        let gateway = SqliteGateway::in_memory().unwrap();
        gateway
            .write_points(&[
                storage_point("prices", 100),
                storage_point("volumes", 150),
                storage_point("prices", 200),
                storage_point("prices", 300),
            ])
            .unwrap();

        let filter = TagFilter::new().tag("topic", "prices");
        let records = gateway.range(Table::Storage, &filter, 100, 300).unwrap();
        let times: Vec<i64> = records.iter().map(|r| r.time).collect();

        // Lower bound exclusive, upper bound inclusive
        assert_eq!(times, vec![200, 300]);
    }

    #[test]
    fn test_by_exact_key_not_found() {
        let gateway = SqliteGateway::in_memory().unwrap();
        gateway.write_points(&[storage_point("prices", 100)]).unwrap();

        let filter = TagFilter::new().tag("topic", "prices");
        assert_eq!(gateway.by_exact_key(Table::Storage, &filter, 100).unwrap().time, 100);

        let err = gateway.by_exact_key(Table::Storage, &filter, 101).unwrap_err();
        assert!(err.is_not_found());

        let other = TagFilter::new().tag("topic", "volumes");
        assert!(gateway.by_exact_key(Table::Storage, &other, 100).unwrap_err().is_not_found());
    }

    #[test]
    fn test_tables_are_separate() {
        let gateway = SqliteGateway::in_memory().unwrap();
        gateway.write_points(&[storage_point("prices", 100)]).unwrap();

        let filter = TagFilter::new().tag("topic", "prices");
        assert!(gateway.latest(Table::Merkle, &filter).unwrap().is_none());
    }

    #[test]
    fn test_record_walk_pages_through_duplicate_times() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let points: Vec<AuditPoint> = (0..7).map(|i| storage_point("prices", 100 + i / 3)).collect();
        gateway.write_points(&points).unwrap();

        let walk = RecordWalk::new(
            &gateway,
            Table::Storage,
            TagFilter::new().tag("topic", "prices"),
            RecordCursor::start(),
            2,
        );
        let records: Vec<AuditRecord> = walk.collect::<AuditResult<_>>().unwrap();

        assert_eq!(records.len(), 7);
        let times: Vec<i64> = records.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![100, 100, 100, 101, 101, 101, 102]);
    }

    #[test]
    fn test_wal_mode_configured() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("audit").join("audit.db");
        let _gateway = SqliteGateway::open(&db_path).unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("audit.db");
        {
            let gateway = SqliteGateway::open(&db_path).unwrap();
            gateway.write_points(&[storage_point("prices", 42)]).unwrap();
        }

        let gateway = SqliteGateway::open(&db_path).unwrap();
        let filter = TagFilter::new().tag("topic", "prices");
        assert_eq!(gateway.latest(Table::Storage, &filter).unwrap().unwrap().time, 42);
    }
}
