//! # Hierarchical Merkle audit trail
//!
//! Raw content is sealed into per-topic storage trees, which are pooled into
//! daily trees one level at a time:
//!
//! ```text
//! payloads -> storage trees (topic) -> level 2 (topic) -> level 1 -> level 0
//! ```
//!
//! ## Module Organization
//!
//! - `gateway` - Time-series store contract (`PersistenceGateway`, `PointSink`)
//! - `sqlite_gateway` - SQLite implementation of the store
//! - `batch` - Batch buffer in front of the store
//! - `pool_index` - Reverse pool index (child -> level-2 parent)
//! - `trail` - `AuditTrail` facade and the id clock
//! - `storage_tree` - Sealing and storage table reads
//! - `daily_tree` - Pooling and daily table reads
//! - `search` - Inclusion search

pub mod batch;
pub mod daily_tree;
pub mod gateway;
pub mod pool_index;
pub mod search;
pub mod sqlite_gateway;
pub mod storage_tree;
pub mod trail;

pub use batch::BatchBuffer;
pub use daily_tree::{DailyTree, Level};
pub use gateway::{AuditPoint, AuditRecord, PersistenceGateway, PointSink, Table, TagFilter};
pub use pool_index::{CacheLookup, MemoryPoolIndex, PoolIndex, SqlitePoolIndex};
pub use search::Inclusion;
pub use sqlite_gateway::SqliteGateway;
pub use storage_tree::{read_storage_tree, RawLeaf, StorageTree, StorageTreeKey};
pub use trail::{AuditTrail, IdClock, TrailOptions};
