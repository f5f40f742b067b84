//! In-memory store
//!
//! Thread-safe reference backend. Each conflict-sensitive write is a single
//! `DashMap` entry operation, so concurrent submitters and aggregator runs
//! converge on one row per natural key.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AggregateStore, InsertOutcome, MappingStore, MeasurementStore, UpsertOutcome};
use crate::error::RollupError;
use crate::metrics::normalize_name;
use crate::period::Granularity;
use crate::status::ProcessingStatus;
use crate::types::{
    AggregateKey, AggregateRecord, CanonicalMapping, DedupKey, RawMeasurement, StatusCounts,
};

/// Store backed by concurrent hash maps
#[derive(Default)]
pub struct MemoryStore {
    measurements: DashMap<Uuid, RawMeasurement>,
    /// Dedup key -> id of the first row inserted with it
    dedup: DashMap<DedupKey, Uuid>,
    aggregates: DashMap<AggregateKey, AggregateRecord>,
    /// Normalized metric name -> mapping
    mappings: DashMap<String, CanonicalMapping>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measurement_count(&self) -> usize {
        self.measurements.len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    /// Every aggregate row, ordered by key
    pub fn all_aggregates(&self) -> Vec<AggregateRecord> {
        let mut rows: Vec<AggregateRecord> =
            self.aggregates.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }
}

fn not_found(id: Uuid) -> RollupError {
    RollupError::Storage(format!("measurement {} not found", id))
}

/// Guarded status change shared by the plain and compare-and-set updates
fn apply_transition(
    record: &mut RawMeasurement,
    status: ProcessingStatus,
    note: Option<&str>,
) -> bool {
    if !record.status.can_transition_to(status) {
        warn!(
            measurement_id = %record.id,
            from = record.status.as_str(),
            to = status.as_str(),
            "Ignoring illegal status transition"
        );
        return false;
    }

    if record.status == ProcessingStatus::Failed && status == ProcessingStatus::Pending {
        record.attempts += 1;
    }
    if let Some(note) = note {
        record.notes = Some(match record.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, note),
            _ => note.to_string(),
        });
    }

    debug!(
        measurement_id = %record.id,
        from = record.status.as_str(),
        to = status.as_str(),
        "Status transition"
    );
    record.status = status;
    record.updated_at = Utc::now();
    true
}

impl MeasurementStore for MemoryStore {
    fn insert_measurement(
        &self,
        measurement: RawMeasurement,
    ) -> Result<InsertOutcome, RollupError> {
        match self.dedup.entry(measurement.dedup_key()) {
            Entry::Occupied(existing) => Ok(InsertOutcome::Duplicate(*existing.get())),
            Entry::Vacant(slot) => {
                let id = measurement.id;
                self.measurements.insert(id, measurement);
                slot.insert(id);
                Ok(InsertOutcome::Inserted(id))
            }
        }
    }

    fn get_measurement(&self, id: Uuid) -> Result<Option<RawMeasurement>, RollupError> {
        Ok(self.measurements.get(&id).map(|m| m.value().clone()))
    }

    fn pending_measurements(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RawMeasurement>, RollupError> {
        let mut pending: Vec<RawMeasurement> = self
            .measurements
            .iter()
            .filter(|m| m.user_id == user_id && m.status.is_pending_work())
            .map(|m| m.value().clone())
            .collect();

        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.start_time.cmp(&b.start_time))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    fn update_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        note: Option<&str>,
    ) -> Result<bool, RollupError> {
        let mut entry = self.measurements.get_mut(&id).ok_or_else(|| not_found(id))?;
        Ok(apply_transition(entry.value_mut(), status, note))
    }

    fn transition_status(
        &self,
        id: Uuid,
        from: &[ProcessingStatus],
        status: ProcessingStatus,
        note: Option<&str>,
    ) -> Result<bool, RollupError> {
        let mut entry = self.measurements.get_mut(&id).ok_or_else(|| not_found(id))?;
        let record = entry.value_mut();

        if !from.contains(&record.status) {
            debug!(
                measurement_id = %id,
                current = record.status.as_str(),
                to = status.as_str(),
                "Status changed underneath, transition skipped"
            );
            return Ok(false);
        }
        Ok(apply_transition(record, status, note))
    }

    fn set_canonical_code(&self, id: Uuid, code: Option<&str>) -> Result<(), RollupError> {
        let mut entry = self.measurements.get_mut(&id).ok_or_else(|| not_found(id))?;
        let record = entry.value_mut();
        record.canonical_code = code.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    fn measurements_between(
        &self,
        user_id: &str,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawMeasurement>, RollupError> {
        let mut rows: Vec<RawMeasurement> = self
            .measurements
            .iter()
            .filter(|m| {
                m.user_id == user_id
                    && m.metric_type == metric_type
                    && m.start_time >= start
                    && m.start_time < end
            })
            .map(|m| m.value().clone())
            .collect();

        rows.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    fn in_flight_measurements(
        &self,
        user_id: &str,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<RawMeasurement>, RollupError> {
        let mut rows: Vec<RawMeasurement> = self
            .measurements
            .iter()
            .filter(|m| {
                m.user_id == user_id && m.status.is_in_flight() && m.updated_at < updated_before
            })
            .map(|m| m.value().clone())
            .collect();

        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    fn status_counts(&self, user_id: &str) -> Result<StatusCounts, RollupError> {
        let mut counts = StatusCounts::default();
        for m in self.measurements.iter().filter(|m| m.user_id == user_id) {
            counts.record(m.status);
        }
        Ok(counts)
    }

    fn users_with_pending(&self) -> Result<Vec<String>, RollupError> {
        let mut users: Vec<String> = self
            .measurements
            .iter()
            .filter(|m| m.status.is_pending_work())
            .map(|m| m.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

impl AggregateStore for MemoryStore {
    fn upsert_aggregate(&self, record: AggregateRecord) -> Result<UpsertOutcome, RollupError> {
        match self.aggregates.entry(record.key()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(UpsertOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get();
                let mut merged = record;
                merged
                    .sources_included
                    .extend(stored.sources_included.iter().cloned());

                if stored.same_content(&merged) {
                    return Ok(UpsertOutcome::Unchanged);
                }

                merged.id = stored.id;
                merged.created_at = stored.created_at;
                slot.insert(merged);
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    fn get_aggregate(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>, RollupError> {
        Ok(self.aggregates.get(key).map(|r| r.value().clone()))
    }

    fn remove_aggregate(&self, key: &AggregateKey) -> Result<bool, RollupError> {
        Ok(self.aggregates.remove(key).is_some())
    }

    fn aggregates_between(
        &self,
        granularity: Granularity,
        user_id: &str,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRecord>, RollupError> {
        let mut rows: Vec<AggregateRecord> = self
            .aggregates
            .iter()
            .filter(|r| {
                r.granularity == granularity
                    && r.user_id == user_id
                    && r.metric_type == metric_type
                    && r.period_start >= start
                    && r.period_start < end
            })
            .map(|r| r.value().clone())
            .collect();

        rows.sort_by(|a, b| {
            a.period_start
                .cmp(&b.period_start)
                .then(a.canonical_code.cmp(&b.canonical_code))
        });
        Ok(rows)
    }
}

impl MappingStore for MemoryStore {
    fn find_mapping(&self, metric_name: &str) -> Result<Option<CanonicalMapping>, RollupError> {
        Ok(self
            .mappings
            .get(&normalize_name(metric_name))
            .map(|m| m.value().clone()))
    }

    fn all_mappings(&self) -> Result<Vec<CanonicalMapping>, RollupError> {
        let mut all: Vec<CanonicalMapping> =
            self.mappings.iter().map(|m| m.value().clone()).collect();
        all.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        Ok(all)
    }

    fn upsert_mapping(&self, mapping: CanonicalMapping) -> Result<UpsertOutcome, RollupError> {
        match self.mappings.entry(normalize_name(&mapping.metric_name)) {
            Entry::Vacant(slot) => {
                slot.insert(mapping);
                Ok(UpsertOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                if slot.get() == &mapping {
                    return Ok(UpsertOutcome::Unchanged);
                }
                slot.insert(mapping);
                Ok(UpsertOutcome::Updated)
            }
        }
    }
}
