//! Storage boundary
//!
//! The engine only needs a handful of atomic primitives from its storage:
//! conflict-ignore insertion of raw rows on the dedup key, a keyed
//! insert-or-update for aggregates and mappings, and guarded status updates.
//! Any backend providing these can host the engine; `MemoryStore` is the
//! reference implementation.

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RollupError;
use crate::period::Granularity;
use crate::status::ProcessingStatus;
use crate::types::{AggregateKey, AggregateRecord, CanonicalMapping, RawMeasurement, StatusCounts};

/// Result of a conflict-ignore insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// A row with the same dedup key exists; carries its id
    Duplicate(Uuid),
}

impl InsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Result of a keyed insert-or-update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored row already had identical content and was left untouched
    Unchanged,
}

/// Raw measurements and their processing status
pub trait MeasurementStore: Send + Sync {
    /// Insert unless a row with the same dedup key exists
    fn insert_measurement(&self, measurement: RawMeasurement)
        -> Result<InsertOutcome, RollupError>;

    fn get_measurement(&self, id: Uuid) -> Result<Option<RawMeasurement>, RollupError>;

    /// Oldest pending-work records of a user, at most `limit`
    fn pending_measurements(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RawMeasurement>, RollupError>;

    /// Move a record to `status`, appending `note` to its notes.
    ///
    /// Returns `false` and leaves the record untouched when the transition is
    /// not allowed. The FAILED -> PENDING retry edge increments `attempts`.
    fn update_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        note: Option<&str>,
    ) -> Result<bool, RollupError>;

    /// Compare-and-set: move to `status` only if the current status is one of
    /// `from`. Two workers racing for the same record cannot both win.
    fn transition_status(
        &self,
        id: Uuid,
        from: &[ProcessingStatus],
        status: ProcessingStatus,
        note: Option<&str>,
    ) -> Result<bool, RollupError>;

    fn set_canonical_code(&self, id: Uuid, code: Option<&str>) -> Result<(), RollupError>;

    /// Measurements of one metric starting in `[start, end)`, ordered by
    /// start time then id
    fn measurements_between(
        &self,
        user_id: &str,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawMeasurement>, RollupError>;

    /// Records of a user left in PROCESSING, CATEGORIZED or AGGREGATED whose
    /// last update is older than `updated_before`
    fn in_flight_measurements(
        &self,
        user_id: &str,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<RawMeasurement>, RollupError>;

    fn status_counts(&self, user_id: &str) -> Result<StatusCounts, RollupError>;

    /// Users with at least one pending-work record, sorted
    fn users_with_pending(&self) -> Result<Vec<String>, RollupError>;
}

/// Aggregate rows of every granularity
pub trait AggregateStore: Send + Sync {
    /// Insert or update by natural key.
    ///
    /// An update keeps the stored id and `created_at` and unions
    /// `sources_included` with the stored set. When the merged row equals the
    /// stored one nothing is written.
    fn upsert_aggregate(&self, record: AggregateRecord) -> Result<UpsertOutcome, RollupError>;

    fn get_aggregate(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>, RollupError>;

    /// Delete the row stored under `key`; `false` when there was none
    fn remove_aggregate(&self, key: &AggregateKey) -> Result<bool, RollupError>;

    /// Rows of one metric whose period starts in `[start, end)`, ordered by
    /// period start then canonical code
    fn aggregates_between(
        &self,
        granularity: Granularity,
        user_id: &str,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRecord>, RollupError>;
}

/// Persistent metric name to canonical code table
pub trait MappingStore: Send + Sync {
    /// Lookup by normalized metric name
    fn find_mapping(&self, metric_name: &str) -> Result<Option<CanonicalMapping>, RollupError>;

    fn all_mappings(&self) -> Result<Vec<CanonicalMapping>, RollupError>;

    /// Idempotent upsert keyed by normalized metric name
    fn upsert_mapping(&self, mapping: CanonicalMapping) -> Result<UpsertOutcome, RollupError>;
}

/// Everything the engine needs from one backend
pub trait Store: MeasurementStore + AggregateStore + MappingStore {}

impl<T: MeasurementStore + AggregateStore + MappingStore> Store for T {}
