//! Error taxonomy for the audit trail
//!
//! A query that matches nothing is not an error: operations return `Ok(None)`
//! for that case. `NotFound` is reserved for lookups of a specific key.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    /// Malformed or empty input to tree building. Never retried.
    #[error("Construction error: {0}")]
    Construction(String),

    /// The time-series store or the cache rejected a read or a write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A specific key lookup (tree by id, parent of a child) had no match.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration value: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        AuditError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::Persistence(err.to_string())
    }
}

impl AuditError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AuditError::NotFound(_))
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
