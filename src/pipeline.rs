//! Pipeline orchestration
//!
//! This module provides the public API of the engine. A batch moves each
//! claimed raw measurement through the processing lifecycle:
//!
//! 1. Claim - PENDING/QUEUED (or FAILED, as a retry) records become PROCESSING
//! 2. Validate - malformed records are marked FAILED on their own
//! 3. Categorize - the metric name is resolved to a canonical code
//! 4. Aggregate - every affected period is re-aggregated, finest first
//! 5. Complete - records end COMPLETED, or FAILED with a diagnostic
//!
//! Records a dead worker left in flight are swept back to FAILED once they are
//! older than the configured stale-claim age, then retried like any failure.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{
    profile_of, Aggregator, DailyAggregator, HourlyAggregator, RollupAggregator,
};
use crate::categorize::{CategorizationMapper, CodeInference, MappingCache, NullInference};
use crate::config::EngineConfig;
use crate::error::RollupError;
use crate::metrics::Semantics;
use crate::period::{Granularity, Period};
use crate::status::ProcessingStatus;
use crate::store::{AggregateStore, InsertOutcome, MeasurementStore, MemoryStore, Store};
use crate::types::{AggregateView, RawMeasurement, StatusCounts};

/// Counters of one or more processed batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Records returned by the pending-work query
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Records another worker moved first
    pub skipped: usize,
    /// Metrics of the batch that resolved to no canonical code
    pub unresolved_codes: usize,
    pub aggregates_written: usize,
    /// The pending-work query returned less than a full page
    pub exhausted: bool,
}

impl BatchReport {
    pub fn merge(&mut self, other: &BatchReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.skipped += other.skipped;
        self.unresolved_codes += other.unresolved_codes;
        self.aggregates_written += other.aggregates_written;
        self.exhausted = other.exhausted;
    }
}

/// Outcome of a bulk submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Aggregation and categorization engine
pub struct RollupEngine {
    store: Arc<dyn Store>,
    mapper: CategorizationMapper,
    hourly: HourlyAggregator,
    daily: DailyAggregator,
    weekly: RollupAggregator,
    monthly: RollupAggregator,
    quarterly: RollupAggregator,
    yearly: RollupAggregator,
    config: EngineConfig,
}

impl RollupEngine {
    /// Create an engine over `store`, seeding the builtin code table
    pub fn new(
        store: Arc<dyn Store>,
        inference: Arc<dyn CodeInference>,
        config: EngineConfig,
    ) -> Result<Self, RollupError> {
        config.validate()?;

        let settings = config.aggregation_settings();
        let cache = Arc::new(MappingCache::new(config.mapping_cache_capacity));
        let mapper = CategorizationMapper::new(
            store.clone(),
            inference,
            cache,
            config.inference_timeout(),
        );
        mapper.seed_builtin()?;

        Ok(Self {
            hourly: HourlyAggregator::new(store.clone(), settings),
            daily: DailyAggregator::new(store.clone(), settings),
            weekly: RollupAggregator::weekly(store.clone(), settings),
            monthly: RollupAggregator::monthly(store.clone(), settings),
            quarterly: RollupAggregator::quarterly(store.clone(), settings),
            yearly: RollupAggregator::yearly(store.clone(), settings),
            store,
            mapper,
            config,
        })
    }

    /// Engine over a fresh in-memory store with no inference collaborator
    pub fn in_memory(config: EngineConfig) -> Result<Self, RollupError> {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(NullInference), config)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn mapper(&self) -> &CategorizationMapper {
        &self.mapper
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dedup-safe insert of one raw measurement as PENDING
    pub fn submit(&self, mut measurement: RawMeasurement) -> Result<InsertOutcome, RollupError> {
        measurement.status = ProcessingStatus::Pending;
        measurement.attempts = 0;
        let outcome = self.store.insert_measurement(measurement)?;
        if let InsertOutcome::Duplicate(id) = outcome {
            debug!(measurement_id = %id, "Duplicate submission ignored");
        }
        Ok(outcome)
    }

    pub fn submit_all(
        &self,
        measurements: impl IntoIterator<Item = RawMeasurement>,
    ) -> Result<SubmitSummary, RollupError> {
        let mut summary = SubmitSummary::default();
        for m in measurements {
            match self.submit(m)? {
                InsertOutcome::Inserted(_) => summary.inserted += 1,
                InsertOutcome::Duplicate(_) => summary.duplicates += 1,
            }
        }
        Ok(summary)
    }

    /// Process one bounded batch of a user's pending work.
    ///
    /// Per-record problems mark that record FAILED. A storage failure aborts
    /// the batch: the claimed records still in flight are marked FAILED so the
    /// next run retries them, and the error is returned.
    pub async fn process_batch(&self, user_id: &str) -> Result<BatchReport, RollupError> {
        let cutoff = Duration::from_std(self.config.stale_claim_age())
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            self.recover_stale_claims(user_id, cutoff)?;
        }

        let limit = self.config.batch_size;
        let pending = self.store.pending_measurements(user_id, limit)?;

        let mut report = BatchReport {
            claimed: pending.len(),
            exhausted: pending.len() < limit,
            ..BatchReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let mut claimed = Vec::with_capacity(pending.len());
        if let Err(e) = self.claim(pending, &mut claimed, &mut report) {
            error!(user_id = %user_id, error = %e, "Claim aborted");
            let ids: Vec<Uuid> = claimed.iter().map(|m| m.id).collect();
            self.release_in_flight(&ids, &e);
            return Err(e);
        }
        let ids: Vec<Uuid> = claimed.iter().map(|m| m.id).collect();

        if let Err(e) = self.process_claimed(user_id, claimed, &mut report).await {
            error!(user_id = %user_id, error = %e, "Batch aborted");
            self.release_in_flight(&ids, &e);
            return Err(e);
        }

        info!(
            user_id = %user_id,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            aggregates = report.aggregates_written,
            "Batch processed"
        );
        Ok(report)
    }

    /// Process batches until the user's pending work is drained
    pub async fn process_pending(&self, user_id: &str) -> Result<BatchReport, RollupError> {
        let mut total = BatchReport::default();
        loop {
            let report = self.process_batch(user_id).await?;
            total.merge(&report);
            if report.exhausted {
                return Ok(total);
            }
        }
    }

    /// Drain the pending work of every user
    pub async fn process_all_pending(&self) -> Result<BatchReport, RollupError> {
        let mut total = BatchReport::default();
        for user_id in self.store.users_with_pending()? {
            let report = self.process_pending(&user_id).await?;
            total.merge(&report);
        }
        Ok(total)
    }

    /// Re-run one aggregator on demand
    pub fn aggregate_period(
        &self,
        user_id: &str,
        metric_type: &str,
        period: &Period,
    ) -> Result<usize, RollupError> {
        self.aggregator(period.granularity)
            .aggregate(user_id, metric_type, period)
    }

    /// Aggregate rows of one metric whose period starts in `[from, to)`
    pub fn aggregates(
        &self,
        granularity: Granularity,
        user_id: &str,
        metric_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateView>, RollupError> {
        Ok(self
            .store
            .aggregates_between(granularity, user_id, metric_type, from, to)?
            .iter()
            .map(|r| r.view())
            .collect())
    }

    pub fn status_counts(&self, user_id: &str) -> Result<StatusCounts, RollupError> {
        self.store.status_counts(user_id)
    }

    /// Mark one record FAILED with a diagnostic
    pub fn mark_failed(&self, id: Uuid, diagnostic: &str) -> Result<bool, RollupError> {
        warn!(measurement_id = %id, diagnostic = %diagnostic, "Measurement failed");
        self.store
            .update_status(id, ProcessingStatus::Failed, Some(diagnostic))
    }

    /// Mark records of a user that sat in flight since before `updated_before`
    /// as FAILED, so the retry path picks them up again
    pub fn recover_stale_claims(
        &self,
        user_id: &str,
        updated_before: DateTime<Utc>,
    ) -> Result<usize, RollupError> {
        let mut recovered = 0;
        for record in self.store.in_flight_measurements(user_id, updated_before)? {
            let released = self.store.transition_status(
                record.id,
                &[record.status],
                ProcessingStatus::Failed,
                Some("stale claim released"),
            )?;
            if released {
                warn!(
                    measurement_id = %record.id,
                    status = record.status.as_str(),
                    updated_at = %record.updated_at,
                    "Stale claim released"
                );
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn aggregator(&self, granularity: Granularity) -> &dyn Aggregator {
        match granularity {
            Granularity::Hour => &self.hourly,
            Granularity::Day => &self.daily,
            Granularity::Week => &self.weekly,
            Granularity::Month => &self.monthly,
            Granularity::Quarter => &self.quarterly,
            Granularity::Year => &self.yearly,
        }
    }

    /// Move pending records to PROCESSING, retrying or dead-lettering FAILED ones.
    ///
    /// Every transition is a compare-and-set on the status the pending query
    /// saw; a record another worker moved first is skipped. Claimed records are
    /// pushed to `claimed` as they are won, so a failing claim step leaves the
    /// caller knowing what to release.
    fn claim(
        &self,
        pending: Vec<RawMeasurement>,
        claimed: &mut Vec<RawMeasurement>,
        report: &mut BatchReport,
    ) -> Result<(), RollupError> {
        use ProcessingStatus::*;

        for record in pending {
            if record.status == Failed {
                if record.attempts >= self.config.max_retries {
                    if self.store.transition_status(
                        record.id,
                        &[Failed],
                        DeadLetter,
                        Some("retry limit reached"),
                    )? {
                        warn!(
                            measurement_id = %record.id,
                            attempts = record.attempts,
                            "Measurement dead-lettered"
                        );
                        report.dead_lettered += 1;
                    } else {
                        report.skipped += 1;
                    }
                    continue;
                }
                if !self
                    .store
                    .transition_status(record.id, &[Failed], Pending, None)?
                {
                    report.skipped += 1;
                    continue;
                }
            }

            if !self
                .store
                .transition_status(record.id, &[Pending, Queued], Processing, None)?
            {
                report.skipped += 1;
                continue;
            }
            claimed.push(record);
        }

        Ok(())
    }

    async fn process_claimed(
        &self,
        user_id: &str,
        claimed: Vec<RawMeasurement>,
        report: &mut BatchReport,
    ) -> Result<(), RollupError> {
        let mut by_metric: BTreeMap<String, Vec<RawMeasurement>> = BTreeMap::new();
        for record in claimed {
            if let Err(e) = record.validate() {
                self.mark_failed(record.id, &format!("invalid measurement: {}", e))?;
                report.failed += 1;
                continue;
            }
            by_metric
                .entry(record.metric_type.clone())
                .or_default()
                .push(record);
        }

        for (metric_type, records) in by_metric {
            let Some(first) = records.first() else {
                continue;
            };
            let resolution = self
                .mapper
                .resolve(&metric_type, first.category.as_deref(), &first.unit)
                .await?;
            if resolution.code.is_none() {
                report.unresolved_codes += 1;
            }

            for record in &records {
                self.store
                    .set_canonical_code(record.id, resolution.code.as_deref())?;
                self.store
                    .update_status(record.id, ProcessingStatus::Categorized, None)?;
            }

            match self.aggregate_records(user_id, &metric_type, &records) {
                Ok(written) => {
                    for record in &records {
                        self.store
                            .update_status(record.id, ProcessingStatus::Completed, None)?;
                    }
                    report.completed += records.len();
                    report.aggregates_written += written;
                }
                Err(e @ RollupError::Storage(_)) => return Err(e),
                Err(e) => {
                    let diagnostic = format!("aggregation failed: {}", e);
                    for record in &records {
                        self.mark_failed(record.id, &diagnostic)?;
                    }
                    report.failed += records.len();
                }
            }
        }

        Ok(())
    }

    /// Re-aggregate every period touched by `records`, finest granularity first
    fn aggregate_records(
        &self,
        user_id: &str,
        metric_type: &str,
        records: &[RawMeasurement],
    ) -> Result<usize, RollupError> {
        let profile = profile_of(metric_type, records);
        let mut written = 0;

        // A sleep span can change which neighbouring day keeps an overlapping span
        let anchors: Vec<DateTime<Utc>> = if profile.semantics == Semantics::Duration {
            records
                .iter()
                .flat_map(|r| {
                    [
                        r.start_time.checked_sub_signed(Duration::days(1)),
                        Some(r.start_time),
                        r.start_time.checked_add_signed(Duration::days(1)),
                    ]
                })
                .flatten()
                .collect()
        } else {
            records.iter().map(|r| r.start_time).collect()
        };

        for (level, granularity) in profile.granularities().iter().enumerate() {
            let periods: BTreeSet<Period> = anchors
                .iter()
                .map(|ts| Period::containing(*granularity, *ts))
                .collect();
            for period in &periods {
                written += self.aggregate_period(user_id, metric_type, period)?;
            }

            if level == 0 {
                for record in records {
                    self.store
                        .update_status(record.id, ProcessingStatus::Aggregated, None)?;
                }
            }
        }

        debug!(
            user_id = %user_id,
            metric = %metric_type,
            records = records.len(),
            written,
            "Metric aggregated"
        );
        Ok(written)
    }

    /// Best effort: mark records left mid-flight by an aborted batch as FAILED
    fn release_in_flight(&self, ids: &[Uuid], cause: &RollupError) {
        let diagnostic = format!("batch aborted: {}", cause);
        for id in ids {
            let in_flight = matches!(
                self.store.get_measurement(*id),
                Ok(Some(ref m)) if m.status.is_in_flight()
            );
            if in_flight {
                if let Err(e) = self
                    .store
                    .update_status(*id, ProcessingStatus::Failed, Some(&diagnostic))
                {
                    error!(measurement_id = %id, error = %e, "Could not release measurement");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorize::InferredCode;
    use crate::status::ClinicalStatus;
    use crate::types::StatValue;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use crate::store::{MappingStore, UpsertOutcome};
    use crate::types::{AggregateKey, AggregateRecord, CanonicalMapping};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn reading(metric: &str, value: &str, unit: &str, start: DateTime<Utc>) -> RawMeasurement {
        RawMeasurement::new("u1", metric, value, unit, start, "watch")
    }

    fn engine() -> RollupEngine {
        RollupEngine::in_memory(EngineConfig::default()).unwrap()
    }

    fn views(engine: &RollupEngine, g: Granularity, metric: &str) -> Vec<AggregateView> {
        engine
            .aggregates(g, "u1", metric, at(1, 0, 0) - Duration::days(400), at(1, 0, 0) + Duration::days(400))
            .unwrap()
    }

    struct ThermometerInference {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeInference for ThermometerInference {
        async fn infer(
            &self,
            metric_name: &str,
            _category: Option<&str>,
            _unit: &str,
        ) -> Result<Option<InferredCode>, RollupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(metric_name.to_lowercase().contains("temperature").then(|| InferredCode {
                code: "8310-5".to_string(),
                source: "stub".to_string(),
            }))
        }
    }

    /// `MemoryStore` with switchable storage faults
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        fail_upserts: AtomicBool,
        /// Claims allowed before the store starts refusing them
        claims_left: AtomicUsize,
        /// Another worker claims each record right before we try to
        steal_claims: AtomicBool,
    }

    impl FaultyStore {
        fn new() -> Arc<Self> {
            let store = Self::default();
            store.claims_left.store(usize::MAX, Ordering::SeqCst);
            Arc::new(store)
        }
    }

    impl MeasurementStore for FaultyStore {
        fn insert_measurement(&self, m: RawMeasurement) -> Result<InsertOutcome, RollupError> {
            self.inner.insert_measurement(m)
        }

        fn get_measurement(&self, id: Uuid) -> Result<Option<RawMeasurement>, RollupError> {
            self.inner.get_measurement(id)
        }

        fn pending_measurements(
            &self,
            user_id: &str,
            limit: usize,
        ) -> Result<Vec<RawMeasurement>, RollupError> {
            self.inner.pending_measurements(user_id, limit)
        }

        fn update_status(
            &self,
            id: Uuid,
            status: ProcessingStatus,
            note: Option<&str>,
        ) -> Result<bool, RollupError> {
            self.inner.update_status(id, status, note)
        }

        fn transition_status(
            &self,
            id: Uuid,
            from: &[ProcessingStatus],
            status: ProcessingStatus,
            note: Option<&str>,
        ) -> Result<bool, RollupError> {
            if status == ProcessingStatus::Processing {
                if self
                    .claims_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
                {
                    return Err(RollupError::Storage("claim refused".to_string()));
                }
                if self.steal_claims.load(Ordering::SeqCst) {
                    self.inner.update_status(id, ProcessingStatus::Processing, None)?;
                }
            }
            self.inner.transition_status(id, from, status, note)
        }

        fn set_canonical_code(&self, id: Uuid, code: Option<&str>) -> Result<(), RollupError> {
            self.inner.set_canonical_code(id, code)
        }

        fn measurements_between(
            &self,
            user_id: &str,
            metric_type: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<RawMeasurement>, RollupError> {
            self.inner.measurements_between(user_id, metric_type, start, end)
        }

        fn in_flight_measurements(
            &self,
            user_id: &str,
            updated_before: DateTime<Utc>,
        ) -> Result<Vec<RawMeasurement>, RollupError> {
            self.inner.in_flight_measurements(user_id, updated_before)
        }

        fn status_counts(&self, user_id: &str) -> Result<StatusCounts, RollupError> {
            self.inner.status_counts(user_id)
        }

        fn users_with_pending(&self) -> Result<Vec<String>, RollupError> {
            self.inner.users_with_pending()
        }
    }

    impl AggregateStore for FaultyStore {
        fn upsert_aggregate(&self, record: AggregateRecord) -> Result<UpsertOutcome, RollupError> {
            if self.fail_upserts.load(Ordering::SeqCst) {
                return Err(RollupError::Storage("aggregate table unavailable".to_string()));
            }
            self.inner.upsert_aggregate(record)
        }

        fn get_aggregate(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>, RollupError> {
            self.inner.get_aggregate(key)
        }

        fn remove_aggregate(&self, key: &AggregateKey) -> Result<bool, RollupError> {
            self.inner.remove_aggregate(key)
        }

        fn aggregates_between(
            &self,
            granularity: Granularity,
            user_id: &str,
            metric_type: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<AggregateRecord>, RollupError> {
            self.inner
                .aggregates_between(granularity, user_id, metric_type, start, end)
        }
    }

    impl MappingStore for FaultyStore {
        fn find_mapping(&self, metric_name: &str) -> Result<Option<CanonicalMapping>, RollupError> {
            self.inner.find_mapping(metric_name)
        }

        fn all_mappings(&self) -> Result<Vec<CanonicalMapping>, RollupError> {
            self.inner.all_mappings()
        }

        fn upsert_mapping(&self, mapping: CanonicalMapping) -> Result<UpsertOutcome, RollupError> {
            self.inner.upsert_mapping(mapping)
        }
    }

    fn faulty_engine(store: &Arc<FaultyStore>) -> RollupEngine {
        RollupEngine::new(store.clone(), Arc::new(NullInference), EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_heart_rate_hourly_average() {
        let engine = engine();
        engine
            .submit_all(vec![
                reading("heart_rate", "70", "bpm", at(15, 8, 5)),
                reading("heart_rate", "80", "bpm", at(15, 8, 35)),
            ])
            .unwrap();

        let report = engine.process_pending("u1").await.unwrap();
        assert_eq!(report.completed, 2);

        let hourly = views(&engine, Granularity::Hour, "heart_rate");
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].period, "2024-01-15T08");
        assert_eq!(hourly[0].value, StatValue::Number(75.0));
        assert_eq!(hourly[0].min, StatValue::Number(70.0));
        assert_eq!(hourly[0].max, StatValue::Number(80.0));
        assert_eq!(hourly[0].count, 2);
        assert_eq!(hourly[0].canonical_code.as_deref(), Some("8867-4"));

        // Every level of the vitals path was maintained
        for g in [Granularity::Day, Granularity::Week, Granularity::Month] {
            let rows = views(&engine, g, "heart_rate");
            assert_eq!(rows.len(), 1, "{}", g);
            assert_eq!(rows[0].value, StatValue::Number(75.0));
        }
        assert!(views(&engine, Granularity::Quarter, "heart_rate").is_empty());
    }

    #[tokio::test]
    async fn test_sleep_awake_span_excluded() {
        let engine = engine();
        engine
            .submit_all(vec![
                reading("sleep_duration", "3.0", "hours", at(15, 23, 0)).with_end_time(at(16, 2, 0)),
                reading("sleep_duration", "0.5", "hours", at(16, 1, 0))
                    .with_end_time(at(16, 1, 30))
                    .with_notes("Awake"),
            ])
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let daily = views(&engine, Granularity::Day, "sleep_duration");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].period, "2024-01-15");
        assert_eq!(daily[0].value, StatValue::Number(3.0));
    }

    #[tokio::test]
    async fn test_sleep_overlap_is_not_double_counted() {
        let engine = engine();
        engine
            .submit_all(vec![
                reading("sleep_duration", "8.0", "hours", at(15, 22, 0)).with_end_time(at(16, 6, 0)),
                RawMeasurement::new("u1", "sleep_duration", "2.0", "hours", at(15, 23, 0), "ring")
                    .with_end_time(at(16, 1, 0)),
            ])
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let daily = views(&engine, Granularity::Day, "sleep_duration");
        assert_eq!(daily[0].value, StatValue::Number(8.0));
        assert!(views(&engine, Granularity::Hour, "sleep_duration").is_empty());
    }

    #[tokio::test]
    async fn test_lab_categorical_degradation() {
        let engine = engine();
        engine
            .submit_all(vec![
                RawMeasurement::new("u1", "ALT", "45", "U/L", at(15, 8, 0), "lab_upload")
                    .with_category("lab_result"),
                RawMeasurement::new("u1", "ALT", "High", "", at(15, 8, 0), "lab_upload")
                    .with_category("lab_result"),
            ])
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let daily = views(&engine, Granularity::Day, "ALT");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].value, StatValue::Text("45, High".to_string()));
        assert_eq!(daily[0].status, ClinicalStatus::Amber);
        assert_eq!(daily[0].canonical_code.as_deref(), Some("1742-6"));

        // Lab path: no hourly rows, but quarter and year are maintained
        assert!(views(&engine, Granularity::Hour, "ALT").is_empty());
        assert_eq!(views(&engine, Granularity::Quarter, "ALT")[0].period, "2024-Q1");
        assert_eq!(views(&engine, Granularity::Year, "ALT")[0].period, "2024");
    }

    #[tokio::test]
    async fn test_steps_are_summed() {
        let engine = engine();
        engine
            .submit_all(vec![
                reading("steps", "500", "count", at(15, 8, 0)),
                reading("steps", "1200", "count", at(15, 8, 40)),
            ])
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let hourly = views(&engine, Granularity::Hour, "steps");
        assert_eq!(hourly[0].value, StatValue::Number(1700.0));
    }

    #[tokio::test]
    async fn test_unseen_metric_is_inferred_once() {
        let inference = Arc::new(ThermometerInference {
            calls: AtomicUsize::new(0),
        });
        let engine = RollupEngine::new(
            Arc::new(MemoryStore::new()),
            inference.clone(),
            EngineConfig::default(),
        )
        .unwrap();

        engine
            .submit(reading("Forehead Temperature", "36.9", "degC", at(15, 8, 0)))
            .unwrap();
        engine.process_pending("u1").await.unwrap();
        let first = views(&engine, Granularity::Hour, "Forehead Temperature");
        assert_eq!(first[0].canonical_code.as_deref(), Some("8310-5"));

        engine
            .submit(reading("Forehead Temperature", "37.1", "degC", at(15, 9, 0)))
            .unwrap();
        engine.process_pending("u1").await.unwrap();
        let second = views(&engine, Granularity::Hour, "Forehead Temperature");
        assert!(second
            .iter()
            .all(|v| v.canonical_code.as_deref() == Some("8310-5")));
        assert_eq!(inference.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresolved_code_still_aggregates() {
        let engine = engine();
        engine
            .submit(reading("mystery_index", "4", "", at(15, 8, 0)))
            .unwrap();
        let report = engine.process_pending("u1").await.unwrap();

        assert_eq!(report.unresolved_codes, 1);
        assert_eq!(report.completed, 1);
        let daily = views(&engine, Granularity::Day, "mystery_index");
        assert_eq!(daily[0].canonical_code, None);
        assert_eq!(daily[0].value, StatValue::Number(4.0));
    }

    #[tokio::test]
    async fn test_rerun_is_byte_identical() {
        let engine = engine();
        engine
            .submit_all(vec![
                reading("heart_rate", "61.3", "bpm", at(15, 8, 5)),
                reading("heart_rate", "77.9", "bpm", at(15, 9, 35)),
                reading("heart_rate", "70.2", "bpm", at(16, 7, 0)),
            ])
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let snapshot = |engine: &RollupEngine| {
            Granularity::ALL
                .iter()
                .map(|g| serde_json::to_string(&views(engine, *g, "heart_rate")).unwrap())
                .collect::<Vec<_>>()
        };
        let before = snapshot(&engine);

        for g in [Granularity::Hour, Granularity::Day, Granularity::Week, Granularity::Month] {
            for day in [15, 16] {
                for hour in [7, 8, 9] {
                    let period = Period::containing(g, at(day, hour, 0));
                    engine.aggregate_period("u1", "heart_rate", &period).unwrap();
                }
            }
        }

        assert_eq!(snapshot(&engine), before);
    }

    #[tokio::test]
    async fn test_new_data_updates_existing_day() {
        let engine = engine();
        engine
            .submit(reading("heart_rate", "60", "bpm", at(15, 8, 0)))
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        engine
            .submit(reading("heart_rate", "80", "bpm", at(15, 14, 0)))
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let daily = views(&engine, Granularity::Day, "heart_rate");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 2);
        assert_eq!(daily[0].value, StatValue::Number(70.0));
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_ignored() {
        let engine = engine();
        let summary = engine
            .submit_all(vec![
                reading("heart_rate", "70", "bpm", at(15, 8, 0)),
                reading("heart_rate", "70", "bpm", at(15, 8, 0)),
            ])
            .unwrap();
        assert_eq!(summary, SubmitSummary { inserted: 1, duplicates: 1 });
    }

    #[tokio::test]
    async fn test_invalid_record_fails_alone_and_dead_letters() {
        let config = EngineConfig {
            max_retries: 1,
            ..EngineConfig::default()
        };
        let engine = RollupEngine::in_memory(config).unwrap();

        let bad = reading("heart_rate", "72", "bpm", at(15, 10, 0)).with_end_time(at(15, 9, 0));
        let bad_id = engine.submit(bad).unwrap().id();
        engine
            .submit(reading("heart_rate", "70", "bpm", at(15, 8, 0)))
            .unwrap();

        let first = engine.process_pending("u1").await.unwrap();
        assert_eq!(first.completed, 1);
        assert_eq!(first.failed, 1);

        let failed = engine.store().get_measurement(bad_id).unwrap().unwrap();
        assert_eq!(failed.status, ProcessingStatus::Failed);
        assert!(failed.notes.unwrap().contains("invalid measurement"));

        // One retry, then the dead-letter state
        let retry = engine.process_pending("u1").await.unwrap();
        assert_eq!(retry.failed, 1);
        let last = engine.process_pending("u1").await.unwrap();
        assert_eq!(last.dead_lettered, 1);

        let counts = engine.status_counts("u1").unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.dead_letter, 1);
        assert_eq!(counts.failed, 0);

        assert_eq!(engine.process_pending("u1").await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let config = EngineConfig {
            batch_size: 2,
            ..EngineConfig::default()
        };
        let engine = RollupEngine::in_memory(config).unwrap();
        engine
            .submit_all((0..5).map(|i| reading("heart_rate", "70", "bpm", at(15, 8, i))))
            .unwrap();

        let first = engine.process_batch("u1").await.unwrap();
        assert_eq!(first.claimed, 2);
        assert!(!first.exhausted);

        let rest = engine.process_pending("u1").await.unwrap();
        assert_eq!(rest.completed, 3);
        assert_eq!(engine.status_counts("u1").unwrap().completed, 5);
    }

    #[tokio::test]
    async fn test_process_all_pending_covers_every_user() {
        let engine = engine();
        engine
            .submit(RawMeasurement::new("a", "heart_rate", "70", "bpm", at(15, 8, 0), "watch"))
            .unwrap();
        engine
            .submit(RawMeasurement::new("b", "heart_rate", "90", "bpm", at(15, 8, 0), "watch"))
            .unwrap();

        let report = engine.process_all_pending().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(engine.status_counts("a").unwrap().completed, 1);
        assert_eq!(engine.status_counts("b").unwrap().completed, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(RollupEngine::in_memory(config).is_err());
    }

    #[tokio::test]
    async fn test_sleep_duplicate_after_midnight_counted_once() {
        let engine = engine();
        engine
            .submit_all(vec![
                reading("sleep_duration", "8.0", "hours", at(15, 22, 0)).with_end_time(at(16, 6, 0)),
                RawMeasurement::new("u1", "sleep_duration", "2.0", "hours", at(16, 0, 30), "ring")
                    .with_end_time(at(16, 2, 30)),
            ])
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let daily = views(&engine, Granularity::Day, "sleep_duration");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].period, "2024-01-15");
        assert_eq!(daily[0].value, StatValue::Number(8.0));

        let weekly = views(&engine, Granularity::Week, "sleep_duration");
        assert_eq!(weekly[0].value, StatValue::Number(8.0));
    }

    #[tokio::test]
    async fn test_late_long_span_absorbs_next_day_duplicate() {
        let engine = engine();
        engine
            .submit(
                RawMeasurement::new("u1", "sleep_duration", "2.0", "hours", at(16, 0, 30), "ring")
                    .with_end_time(at(16, 2, 30)),
            )
            .unwrap();
        engine.process_pending("u1").await.unwrap();
        assert_eq!(views(&engine, Granularity::Day, "sleep_duration")[0].period, "2024-01-16");

        engine
            .submit(reading("sleep_duration", "8.0", "hours", at(15, 22, 0)).with_end_time(at(16, 6, 0)))
            .unwrap();
        engine.process_pending("u1").await.unwrap();

        let daily = views(&engine, Granularity::Day, "sleep_duration");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].period, "2024-01-15");
        let weekly = views(&engine, Granularity::Week, "sleep_duration");
        assert_eq!(weekly[0].value, StatValue::Number(8.0));
        let monthly = views(&engine, Granularity::Month, "sleep_duration");
        assert_eq!(monthly[0].value, StatValue::Number(8.0));
    }

    #[tokio::test]
    async fn test_storage_failure_releases_batch_for_retry() {
        let store = FaultyStore::new();
        let engine = faulty_engine(&store);
        engine
            .submit_all(vec![
                reading("heart_rate", "70", "bpm", at(15, 8, 0)),
                reading("heart_rate", "80", "bpm", at(15, 8, 30)),
            ])
            .unwrap();

        store.fail_upserts.store(true, Ordering::SeqCst);
        let err = engine.process_batch("u1").await.unwrap_err();
        assert!(matches!(err, RollupError::Storage(_)));

        let counts = engine.status_counts("u1").unwrap();
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.processing + counts.categorized + counts.aggregated, 0);
        for record in store.inner.pending_measurements("u1", 10).unwrap() {
            assert!(record.notes.unwrap().contains("batch aborted"));
        }

        store.fail_upserts.store(false, Ordering::SeqCst);
        let retry = engine.process_pending("u1").await.unwrap();
        assert_eq!(retry.completed, 2);

        let daily = views(&engine, Granularity::Day, "heart_rate");
        assert_eq!(daily[0].count, 2);
        assert_eq!(daily[0].value, StatValue::Number(75.0));
    }

    #[tokio::test]
    async fn test_claim_failure_releases_claimed_records() {
        let store = FaultyStore::new();
        let engine = faulty_engine(&store);
        engine
            .submit_all((0..3).map(|i| reading("heart_rate", "70", "bpm", at(15, 8, i))))
            .unwrap();

        store.claims_left.store(1, Ordering::SeqCst);
        assert!(engine.process_batch("u1").await.is_err());

        let counts = engine.status_counts("u1").unwrap();
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 2);

        store.claims_left.store(usize::MAX, Ordering::SeqCst);
        assert_eq!(engine.process_pending("u1").await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn test_record_claimed_elsewhere_is_skipped() {
        let store = FaultyStore::new();
        let engine = faulty_engine(&store);
        let id = engine
            .submit(reading("heart_rate", "70", "bpm", at(15, 8, 0)))
            .unwrap()
            .id();

        store.steal_claims.store(true, Ordering::SeqCst);
        let report = engine.process_batch("u1").await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.completed, 0);
        assert!(views(&engine, Granularity::Hour, "heart_rate").is_empty());
        assert_eq!(
            store.get_measurement(id).unwrap().unwrap().status,
            ProcessingStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_stale_claim_is_recovered() {
        let engine = engine();
        let id = engine
            .submit(reading("heart_rate", "70", "bpm", at(15, 8, 0)))
            .unwrap()
            .id();
        // A worker claimed the record and died
        engine
            .store()
            .update_status(id, ProcessingStatus::Processing, None)
            .unwrap();

        assert_eq!(engine.process_pending("u1").await.unwrap().claimed, 0);
        assert_eq!(engine.recover_stale_claims("u1", at(1, 0, 0)).unwrap(), 0);
        assert_eq!(
            engine
                .recover_stale_claims("u1", Utc::now() + Duration::seconds(1))
                .unwrap(),
            1
        );

        let report = engine.process_pending("u1").await.unwrap();
        assert_eq!(report.completed, 1);
        let record = engine.store().get_measurement(id).unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.notes.unwrap().contains("stale claim"));
    }

    #[tokio::test]
    async fn test_batch_sweeps_claims_older_than_configured_age() {
        let config = EngineConfig {
            stale_claim_secs: 1,
            ..EngineConfig::default()
        };
        let engine = RollupEngine::in_memory(config).unwrap();
        let id = engine
            .submit(reading("heart_rate", "70", "bpm", at(15, 8, 0)))
            .unwrap()
            .id();
        engine
            .store()
            .update_status(id, ProcessingStatus::Categorized, None)
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let report = engine.process_pending("u1").await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(engine.status_counts("u1").unwrap().completed, 1);
    }
}
