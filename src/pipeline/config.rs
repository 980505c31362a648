//! Runtime configuration from environment variables

use crate::audit_core::{
    AuditTrail, MemoryPoolIndex, PoolIndex, SqliteGateway, SqlitePoolIndex, TrailOptions,
};
use crate::error::{AuditError, AuditResult};
use chrono::Duration;
use std::env;
use std::str::FromStr;
use std::sync::Arc;

/// Which engine backs the reverse pool index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Sqlite,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(CacheBackend::Sqlite),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(AuditError::Config(format!(
                "unknown AUDIT_CACHE_BACKEND '{}' (expected sqlite or memory)",
                other
            ))),
        }
    }
}

/// Configuration for the audit runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Path to the time-series SQLite database
    pub db_path: String,

    pub cache_backend: CacheBackend,

    /// Path to the pool index database (SQLite backend only)
    pub cache_path: String,

    /// Topics pooled into level 2 trees
    pub topics: Vec<String>,

    /// Channel buffer size for raw content
    pub channel_buffer: usize,

    /// Storage tree sealing interval in milliseconds
    pub seal_interval_ms: u64,

    /// Seal a topic early once this many leaves are buffered
    pub seal_max_leaves: usize,

    /// Daily pooling interval in milliseconds
    pub pool_interval_ms: u64,

    pub batch_max_points: usize,

    pub lookback_days: i64,

    pub search_max_probes: usize,

    /// Master enable flag
    pub enabled: bool,
}

impl AuditConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `AUDIT_DB_PATH` (default: /var/lib/audit/audit.db)
    /// - `AUDIT_CACHE_BACKEND` (default: sqlite)
    /// - `AUDIT_CACHE_PATH` (default: /var/lib/audit/pool_index.db)
    /// - `AUDIT_TOPICS` (default: empty, comma separated)
    /// - `AUDIT_CHANNEL_BUFFER` (default: 10000)
    /// - `AUDIT_SEAL_INTERVAL_MS` (default: 60000)
    /// - `AUDIT_SEAL_MAX_LEAVES` (default: 1000)
    /// - `AUDIT_POOL_INTERVAL_MS` (default: 86400000)
    /// - `AUDIT_BATCH_MAX_POINTS` (default: 5000)
    /// - `AUDIT_LOOKBACK_DAYS` (default: 10)
    /// - `AUDIT_SEARCH_MAX_PROBES` (default: 1)
    /// - `ENABLE_AUDIT_TRAIL` (default: false)
    pub fn from_env() -> AuditResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> AuditResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str, default| -> AuditResult<u64> {
            match lookup(key) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    AuditError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))
                }),
                None => Ok(default),
            }
        };

        let cache_backend = match lookup("AUDIT_CACHE_BACKEND") {
            Some(raw) => raw.trim().parse()?,
            None => CacheBackend::Sqlite,
        };

        let topics = lookup("AUDIT_TOPICS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            db_path: lookup("AUDIT_DB_PATH")
                .unwrap_or_else(|| "/var/lib/audit/audit.db".to_string()),

            cache_backend,

            cache_path: lookup("AUDIT_CACHE_PATH")
                .unwrap_or_else(|| "/var/lib/audit/pool_index.db".to_string()),

            topics,

            channel_buffer: parsed("AUDIT_CHANNEL_BUFFER", 10_000)? as usize,

            seal_interval_ms: parsed("AUDIT_SEAL_INTERVAL_MS", 60_000)?,

            seal_max_leaves: parsed("AUDIT_SEAL_MAX_LEAVES", 1_000)? as usize,

            pool_interval_ms: parsed("AUDIT_POOL_INTERVAL_MS", 86_400_000)?,

            batch_max_points: parsed("AUDIT_BATCH_MAX_POINTS", 5_000)? as usize,

            lookback_days: parsed("AUDIT_LOOKBACK_DAYS", 10)? as i64,

            search_max_probes: parsed("AUDIT_SEARCH_MAX_PROBES", 1)? as usize,

            enabled: lookup("ENABLE_AUDIT_TRAIL")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AuditResult<()> {
        if self.channel_buffer == 0 {
            return Err(AuditError::Config("AUDIT_CHANNEL_BUFFER must be > 0".to_string()));
        }
        if self.seal_interval_ms == 0 || self.pool_interval_ms == 0 {
            return Err(AuditError::Config(
                "sealing and pooling intervals must be > 0".to_string(),
            ));
        }
        if self.seal_max_leaves == 0 {
            return Err(AuditError::Config("AUDIT_SEAL_MAX_LEAVES must be > 0".to_string()));
        }
        if !(0..=36_500).contains(&self.lookback_days) {
            return Err(AuditError::Config(format!(
                "AUDIT_LOOKBACK_DAYS out of range: {}",
                self.lookback_days
            )));
        }
        Ok(())
    }

    pub fn trail_options(&self) -> TrailOptions {
        TrailOptions {
            lookback: Duration::days(self.lookback_days),
            max_search_probes: self.search_max_probes.max(1),
            max_points_in_batch: self.batch_max_points.max(1),
            ..TrailOptions::default()
        }
    }

    /// Open the store and pool index and assemble the audit trail
    pub fn open_trail(&self) -> AuditResult<AuditTrail> {
        let store = Arc::new(SqliteGateway::open(&self.db_path)?);
        let pool_index: Arc<dyn PoolIndex> = match self.cache_backend {
            CacheBackend::Sqlite => Arc::new(SqlitePoolIndex::open(&self.cache_path)?),
            CacheBackend::Memory => Arc::new(MemoryPoolIndex::new()),
        };
        Ok(AuditTrail::new(store, pool_index, self.trail_options()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AuditConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.db_path, "/var/lib/audit/audit.db");
        assert_eq!(config.cache_backend, CacheBackend::Sqlite);
        assert_eq!(config.cache_path, "/var/lib/audit/pool_index.db");
        assert!(config.topics.is_empty());
        assert_eq!(config.channel_buffer, 10_000);
        assert_eq!(config.seal_interval_ms, 60_000);
        assert_eq!(config.seal_max_leaves, 1_000);
        assert_eq!(config.pool_interval_ms, 86_400_000);
        assert_eq!(config.batch_max_points, 5_000);
        assert_eq!(config.lookback_days, 10);
        assert_eq!(config.search_max_probes, 1);
        assert!(!config.enabled);
    }

    #[test]
    fn test_custom_config() {
        let config = AuditConfig::from_lookup(lookup_from(&[
            ("AUDIT_DB_PATH", "/tmp/test.db"),
            ("AUDIT_CACHE_BACKEND", "Memory"),
            ("AUDIT_TOPICS", "prices, volumes,,"),
            ("AUDIT_SEAL_INTERVAL_MS", "2000"),
            ("AUDIT_SEARCH_MAX_PROBES", "4"),
            ("ENABLE_AUDIT_TRAIL", "true"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.cache_backend, CacheBackend::Memory);
        assert_eq!(config.topics, vec!["prices".to_string(), "volumes".to_string()]);
        assert_eq!(config.seal_interval_ms, 2_000);
        assert!(config.enabled);

        let options = config.trail_options();
        assert_eq!(options.max_search_probes, 4);
        assert_eq!(options.lookback, Duration::days(10));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AuditConfig::from_lookup(lookup_from(&[("AUDIT_CHANNEL_BUFFER", "lots")]))
            .unwrap_err();
        assert!(matches!(err, AuditError::Config(_)));

        let err = AuditConfig::from_lookup(lookup_from(&[("AUDIT_CACHE_BACKEND", "redis")]))
            .unwrap_err();
        assert!(matches!(err, AuditError::Config(_)));

        let err = AuditConfig::from_lookup(lookup_from(&[("AUDIT_SEAL_MAX_LEAVES", "0")]))
            .unwrap_err();
        assert!(matches!(err, AuditError::Config(_)));
    }

    #[test]
    fn test_open_trail_creates_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store/audit.db");
        let cache_path = dir.path().join("cache/pool_index.db");

        let config = AuditConfig::from_lookup(lookup_from(&[
            ("AUDIT_DB_PATH", db_path.to_str().unwrap()),
            ("AUDIT_CACHE_PATH", cache_path.to_str().unwrap()),
        ]))
        .unwrap();

        let trail = config.open_trail().unwrap();
        assert_eq!(trail.pool_index().backend_type(), "sqlite");
        assert!(db_path.exists());
        assert!(cache_path.exists());
    }

    #[test]
    fn test_backend_type_names_the_configured_backend() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("audit.db");
        let cache_path = dir.path().join("pool_index.db");

        for backend in ["sqlite", "memory"] {
            let config = AuditConfig::from_lookup(lookup_from(&[
                ("AUDIT_DB_PATH", db_path.to_str().unwrap()),
                ("AUDIT_CACHE_PATH", cache_path.to_str().unwrap()),
                ("AUDIT_CACHE_BACKEND", backend),
            ]))
            .unwrap();

            let trail = config.open_trail().unwrap();
            let reported = trail.pool_index().backend_type();
            assert_eq!(reported, backend);
            assert_eq!(reported.parse::<CacheBackend>().unwrap(), config.cache_backend);
        }
    }
}
