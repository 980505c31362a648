//! Audit trail facade
//!
//! `AuditTrail` owns the write path (batch buffer in front of the store), the
//! read path (persistence gateway) and the reverse pool index. The sealing,
//! pooling and search operations are implemented on it in `storage_tree`,
//! `daily_tree` and `search`.

use super::batch::{BatchBuffer, DEFAULT_MAX_POINTS_IN_BATCH};
use super::gateway::{AuditPoint, PersistenceGateway, PointSink};
use super::pool_index::PoolIndex;
use crate::error::{AuditError, AuditResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Current time as Unix nanoseconds
pub fn now_nanos() -> i64 {
    datetime_to_nanos(Utc::now())
}

/// Unix nanoseconds of `dt`, clamped to the representable range
pub fn datetime_to_nanos(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt()
        .unwrap_or(if dt.timestamp() > 0 { i64::MAX } else { i64::MIN })
}

pub fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Monotonic nanosecond clock for build times and tree ids
///
/// Never returns the same value twice, even when the wall clock stalls or
/// steps backwards. Every trail in the process draws from `ID_CLOCK`.
#[derive(Debug, Default)]
pub struct IdClock {
    last: AtomicI64,
}

impl IdClock {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self) -> i64 {
        let now = now_nanos();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(current) => last = current,
            }
        }
    }
}

static ID_CLOCK: IdClock = IdClock::new();

/// Held from taking an id until the record keyed by it is durable
///
/// Records keyed by clock ids therefore commit in id order, so a reader that
/// takes its own id sees every record with a smaller one.
static COMMIT_ORDER: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
pub struct TrailOptions {
    /// Bootstrap window for `last_timestamp` on an empty store
    pub lookback: Duration,
    /// Storage trees probed by inclusion search before giving up
    pub max_search_probes: usize,
    pub max_points_in_batch: usize,
    /// Page size when walking durable records (parent scan, index rebuild)
    pub walk_page_size: usize,
}

impl Default for TrailOptions {
    fn default() -> Self {
        Self {
            lookback: Duration::days(10),
            max_search_probes: 1,
            max_points_in_batch: DEFAULT_MAX_POINTS_IN_BATCH,
            walk_page_size: 256,
        }
    }
}

pub struct AuditTrail {
    pub(crate) gateway: Arc<dyn PersistenceGateway>,
    pub(crate) batch: BatchBuffer,
    pub(crate) pool_index: Arc<dyn PoolIndex>,
    pub(crate) options: TrailOptions,
}

impl AuditTrail {
    pub fn new<G>(store: Arc<G>, pool_index: Arc<dyn PoolIndex>, options: TrailOptions) -> Self
    where
        G: PersistenceGateway + PointSink + 'static,
    {
        let sink: Arc<dyn PointSink> = store.clone();
        let gateway: Arc<dyn PersistenceGateway> = store;

        log::info!(
            "✅ Audit trail ready (pool index: {}, batch threshold: {} points)",
            pool_index.backend_type(),
            options.max_points_in_batch
        );

        Self {
            gateway,
            batch: BatchBuffer::new(sink, options.max_points_in_batch),
            pool_index,
            options,
        }
    }

    pub fn gateway(&self) -> &dyn PersistenceGateway {
        self.gateway.as_ref()
    }

    pub fn pool_index(&self) -> &dyn PoolIndex {
        self.pool_index.as_ref()
    }

    pub fn options(&self) -> &TrailOptions {
        &self.options
    }

    /// Fresh UnixNano-based identifier for a tree about to be created
    pub fn next_id(&self) -> i64 {
        ID_CLOCK.next()
    }

    /// Run `commit` with a fresh id while holding the commit order lock
    ///
    /// `commit` must make its record durable before returning.
    pub(crate) fn with_next_id<T>(
        &self,
        commit: impl FnOnce(i64) -> AuditResult<T>,
    ) -> AuditResult<T> {
        let _order = COMMIT_ORDER
            .lock()
            .map_err(|_| AuditError::Persistence("commit order lock poisoned".to_string()))?;
        commit(ID_CLOCK.next())
    }

    /// Flush whatever is pending in the batch buffer
    pub fn flush_audit_batch(&self) -> AuditResult<()> {
        self.batch.flush()
    }

    /// Append a point and flush, so the point is durable when this returns
    pub(crate) fn write_durable(&self, point: AuditPoint) -> AuditResult<()> {
        self.batch.append_and_flush(point)
    }
}
