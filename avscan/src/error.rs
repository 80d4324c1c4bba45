//! Per-record error types
//!
//! Every variant here is recoverable: it degrades the output of one record
//! (statistics or label file missing) without stopping the batch.

use crate::literal::LiteralError;
use thiserror::Error;

/// Problems found while post-processing one normalized record
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    /// Record root is not a mapping
    #[error("Record is not a mapping")]
    NotAMapping,

    /// `attributes` could not be brought into mapping form
    #[error("Malformed attributes: {0}")]
    MalformedAttributes(String),

    /// `attributes.stats` absent or not a mapping of counts
    #[error("Missing stats: {0}")]
    MissingStats(String),

    /// `attributes.results` absent or not a mapping of engine entries
    #[error("Missing results: {0}")]
    MissingResults(String),
}

impl From<LiteralError> for RecordError {
    fn from(err: LiteralError) -> Self {
        RecordError::MalformedAttributes(format!("attributes string is not a literal: {}", err))
    }
}
