//! Error types for Synheart Rollup

use thiserror::Error;

use crate::period::Granularity;

/// Errors that can occur while ingesting, categorizing or aggregating
#[derive(Debug, Error)]
pub enum RollupError {
    #[error("Failed to parse submission: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid measurement: {0}")]
    Validation(#[from] crate::schema::ValidationError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0} aggregates are built from raw measurements, not rolled up")]
    UnsupportedRollup(Granularity),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Canonical code inference failed: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),
}
