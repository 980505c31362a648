//! # Audit runtime pipeline
//!
//! Async plumbing around the synchronous audit core:
//!
//! 1. A content source (JSONL) pushes raw content into an mpsc channel
//! 2. The ingestion task buffers it per topic and seals storage trees
//! 3. The pooling scheduler rolls storage trees up into daily trees
//!
//! ## Module Organization
//!
//! - `config` - Environment configuration
//! - `ingestion` - Channel processor and per-topic seal buffer
//! - `scheduler` - Periodic pooling over every level
//! - `source` - JSONL content source

pub mod config;
pub mod ingestion;
pub mod scheduler;
pub mod source;

pub use config::{AuditConfig, CacheBackend};
pub use ingestion::{start_audit_ingestion, RawContent, SealBuffer};
pub use scheduler::{pooling_scheduler_task, run_pooling_cycle, PoolingReport};
pub use source::{forward_jsonl, parse_content_line};
