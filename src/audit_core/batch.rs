//! Batch buffer for audit points
//!
//! One shared batch per writer, guarded by a mutex: appending a point and the
//! flush it may trigger run as a single step under the lock, so concurrent
//! sealers and poolers never interleave inside a flush.
//!
//! Failure policy: when the sink rejects a flush, the pending points are
//! dropped and the writer continues with a fresh empty batch. Audit writes are
//! therefore at-most-once; the error is returned to the caller, who retries the
//! whole sealing or pooling cycle.

use super::gateway::{AuditPoint, PointSink};
use crate::error::{AuditError, AuditResult};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_MAX_POINTS_IN_BATCH: usize = 5000;

#[derive(Default)]
struct PendingBatch {
    points: Vec<AuditPoint>,
}

pub struct BatchBuffer {
    sink: Arc<dyn PointSink>,
    pending: Mutex<PendingBatch>,
    max_points: usize,
}

impl BatchBuffer {
    pub fn new(sink: Arc<dyn PointSink>, max_points: usize) -> Self {
        Self {
            sink,
            pending: Mutex::new(PendingBatch::default()),
            max_points: max_points.max(1),
        }
    }

    fn lock(&self) -> AuditResult<MutexGuard<'_, PendingBatch>> {
        self.pending
            .lock()
            .map_err(|_| AuditError::Persistence("audit batch lock poisoned".to_string()))
    }

    /// Add a point; flushes when the batch reaches its size threshold
    pub fn append(&self, point: AuditPoint) -> AuditResult<()> {
        let mut pending = self.lock()?;
        pending.points.push(point);

        if pending.points.len() >= self.max_points {
            log::debug!("Batch threshold reached ({} points), forcing write", self.max_points);
            self.flush_locked(&mut pending)?;
        }
        Ok(())
    }

    /// Add a point and flush immediately
    ///
    /// Returns only after the point is durable (or the batch was discarded).
    pub fn append_and_flush(&self, point: AuditPoint) -> AuditResult<()> {
        let mut pending = self.lock()?;
        pending.points.push(point);
        self.flush_locked(&mut pending)
    }

    /// Write every pending point to the sink
    pub fn flush(&self) -> AuditResult<()> {
        let mut pending = self.lock()?;
        self.flush_locked(&mut pending)
    }

    pub fn pending_points(&self) -> usize {
        self.lock().map(|p| p.points.len()).unwrap_or(0)
    }

    fn flush_locked(&self, pending: &mut PendingBatch) -> AuditResult<()> {
        if pending.points.is_empty() {
            return Ok(());
        }

        match self.sink.write_points(&pending.points) {
            Ok(()) => {
                log::debug!("✅ Flushed {} audit points", pending.points.len());
                pending.points.clear();
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "❌ Audit batch write failed, discarding {} points: {}",
                    pending.points.len(),
                    e
                );
                *pending = PendingBatch::default();
                Err(e)
            }
        }
    }
}
