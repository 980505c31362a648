pub mod audit_core;
pub mod error;
pub mod merkle;
pub mod pipeline;

pub use error::{AuditError, AuditResult};
