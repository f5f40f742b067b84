//! Synheart Rollup - Categorization and multi-granularity aggregation of health time series
//!
//! Rollup turns raw health measurements (vitals, sleep, lab results) from many
//! sources into canonical statistical summaries through an idempotent batch
//! pipeline: intake → claim → categorize → hourly/daily aggregation → weekly,
//! monthly, quarterly and yearly rollups.
//!
//! ## Modules
//!
//! - **Pipeline**: `RollupEngine` drives batches and exposes the read side
//! - **Aggregation**: one aggregator per granularity, all upserting by natural key
//! - **Categorization**: metric names resolved to canonical (LOINC) codes
//! - **Worker**: background tokio tasks fed by a fire-and-forget trigger channel

pub mod aggregate;
pub mod categorize;
pub mod coerce;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalizer;
pub mod overlap;
pub mod period;
pub mod pipeline;
pub mod reference_range;
pub mod schema;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

pub use aggregate::{AggregationSettings, Aggregator};
pub use categorize::{CategorizationMapper, CodeInference, InferredCode, MappingCache, NullInference};
pub use config::EngineConfig;
pub use error::RollupError;
pub use period::{Granularity, Period};
pub use pipeline::{BatchReport, RollupEngine, SubmitSummary};
pub use status::{ClinicalStatus, ProcessingStatus};
pub use store::{MemoryStore, Store};
pub use types::{AggregateRecord, AggregateView, CanonicalMapping, RawMeasurement, StatusCounts};
pub use worker::{AggregationWorker, Trigger, TriggerHandle};

// Schema exports
pub use schema::{MeasurementSubmission, SubmissionAdapter, SCHEMA_VERSION};

/// Rollup version, reported by the CLI
pub const ROLLUP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name stamped on exported aggregates
pub const PRODUCER_NAME: &str = "synheart-rollup";
