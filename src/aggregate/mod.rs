//! Period aggregators
//!
//! One aggregator per granularity. Each loads the rows of one period (raw
//! measurements or the next lower granularity), folds them per canonical code
//! and upserts one row per `(user, metric, code, period)`.
//!
//! - `HourlyAggregator`: categorized raw measurements
//! - `DailyAggregator`: hourly rows for vitals, raw rows for labs, overlap
//!   resolved spans for sleep
//! - `RollupAggregator`: week, month, quarter and year from the lower level

mod daily;
mod hourly;
mod rollup;
pub mod stats;

pub use daily::DailyAggregator;
pub use hourly::HourlyAggregator;
pub use rollup::RollupAggregator;
pub use stats::{Stats, StatsAccumulator, StatusTally, Tally};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coerce::Coerced;
use crate::error::RollupError;
use crate::metrics::{MetricProfile, Semantics};
use crate::normalizer::UnitNormalizer;
use crate::overlap::SleepBounds;
use crate::period::{Granularity, Period};
use crate::status::ClinicalStatus;
use crate::store::{AggregateStore, Store, UpsertOutcome};
use crate::types::{AggregateRecord, RawMeasurement};
use stats::BoundsMean;

/// Tunables shared by every aggregator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// Status used when no contributing row carries status information
    pub default_status: ClinicalStatus,
    /// Upper bound, in chars, of categorical strings
    pub max_text_len: usize,
    pub sleep_bounds: SleepBounds,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            default_status: ClinicalStatus::Amber,
            max_text_len: 255,
            sleep_bounds: SleepBounds::default(),
        }
    }
}

/// Common contract of every granularity
pub trait Aggregator: Send + Sync {
    fn granularity(&self) -> Granularity;

    /// Re-aggregate one period. Returns the number of rows upserted; 0 when
    /// the period has no source rows (no empty aggregates are written).
    fn aggregate(
        &self,
        user_id: &str,
        metric_type: &str,
        period: &Period,
    ) -> Result<usize, RollupError>;
}

/// Folded content of one aggregate row, before identity is attached
#[derive(Debug, Clone)]
pub(crate) struct PeriodSummary {
    pub stats: Stats,
    pub semantics: Semantics,
    pub unit: String,
    pub status: ClinicalStatus,
    pub reference_min: Option<f64>,
    pub reference_max: Option<f64>,
    pub primary_source: String,
    pub sources_included: BTreeSet<String>,
}

impl PeriodSummary {
    pub fn into_record(
        self,
        user_id: &str,
        metric_type: &str,
        canonical_code: Option<String>,
        period: &Period,
    ) -> AggregateRecord {
        let now = Utc::now();
        AggregateRecord {
            id: Uuid::new_v4(),
            granularity: period.granularity,
            user_id: user_id.to_string(),
            metric_type: metric_type.to_string(),
            canonical_code,
            period_key: period.key(),
            period_start: period.start,
            period_end: period.end,
            semantics: self.semantics,
            mode: self.stats.mode,
            count: self.stats.count,
            total_value: self.stats.total,
            average_value: self.stats.average,
            min_value: self.stats.min,
            max_value: self.stats.max,
            distinct_values: self.stats.distinct_values,
            unit: self.unit,
            status: self.status,
            reference_min: self.reference_min,
            reference_max: self.reference_max,
            primary_source: self.primary_source,
            sources_included: self.sources_included,
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) fn ensure_granularity(expected: Granularity, period: &Period) -> Result<(), RollupError> {
    if period.granularity != expected {
        return Err(RollupError::InvalidPeriod(format!(
            "{} aggregator given {} period",
            expected, period.granularity
        )));
    }
    Ok(())
}

/// Profile of a metric as seen in a set of its measurements
pub(crate) fn profile_of(metric_type: &str, rows: &[RawMeasurement]) -> MetricProfile {
    let category = rows.iter().find_map(|r| r.category.as_deref());
    let has_range = rows.iter().any(|r| r.reference_range.is_some());
    MetricProfile::resolve(metric_type, category, has_range)
}

/// Partition rows by canonical code, preserving input order within a group
pub(crate) fn group_by_code<T>(
    rows: Vec<T>,
    code: impl Fn(&T) -> Option<String>,
) -> BTreeMap<Option<String>, Vec<T>> {
    let mut groups: BTreeMap<Option<String>, Vec<T>> = BTreeMap::new();
    for row in rows {
        groups.entry(code(&row)).or_default().push(row);
    }
    groups
}

/// Unit label of a period; several units are all listed so the mismatch stays
/// visible downstream
pub(crate) fn unit_label(units: &Tally, metric_type: &str) -> String {
    let label = units.keys().cloned().collect::<Vec<_>>().join(", ");
    if units.distinct() > 1 {
        warn!(metric = %metric_type, units = %label, "Mixed units in one period");
    }
    label
}

/// Fold raw measurements of one period and code
pub(crate) fn summarize_measurements(
    rows: &[RawMeasurement],
    metric_type: &str,
    profile: &MetricProfile,
    settings: &AggregationSettings,
) -> Option<PeriodSummary> {
    let mut acc = StatsAccumulator::new(profile.semantics);
    let mut units = Tally::default();
    let mut statuses = StatusTally::default();
    let mut bounds = BoundsMean::default();
    let mut sources = Tally::default();

    for row in rows {
        match row.coerced_value() {
            Coerced::Numeric(v) => {
                let normalized = UnitNormalizer::normalize_in(profile.units, v, &row.unit);
                if !normalized.unit.is_empty() {
                    units.add(&normalized.unit);
                }
                acc.add_value(&Coerced::Numeric(normalized.value));
            }
            text => {
                if !row.unit.trim().is_empty() {
                    units.add(row.unit.trim());
                }
                acc.add_value(&text);
            }
        }

        statuses.add(row.clinical_status());
        let range = row.parsed_reference_range();
        bounds.add(range.min, range.max);
        sources.add(&row.source);
    }

    let stats = acc.finish(settings.max_text_len)?;
    Some(PeriodSummary {
        stats,
        semantics: profile.semantics,
        unit: unit_label(&units, metric_type),
        status: statuses.resolve(settings.default_status),
        reference_min: bounds.min(),
        reference_max: bounds.max(),
        primary_source: sources.most_common().unwrap_or_default().to_string(),
        sources_included: sources.keys().cloned().collect(),
    })
}

/// Fold lower-granularity rows of one period and code
pub(crate) fn summarize_aggregates(
    rows: &[AggregateRecord],
    metric_type: &str,
    settings: &AggregationSettings,
) -> Option<PeriodSummary> {
    let semantics = rows.first()?.semantics;
    let mut acc = StatsAccumulator::new(semantics);
    let mut units = Tally::default();
    let mut statuses = StatusTally::default();
    let mut bounds = BoundsMean::default();
    let mut primary = Tally::default();
    let mut included = BTreeSet::new();

    for row in rows {
        acc.add_aggregate(row);
        if !row.unit.is_empty() {
            units.add(&row.unit);
        }
        statuses.add(Some(row.status));
        bounds.add(row.reference_min, row.reference_max);
        primary.add_n(&row.primary_source, row.count as usize);
        included.extend(row.sources_included.iter().cloned());
    }

    let stats = acc.finish(settings.max_text_len)?;
    Some(PeriodSummary {
        stats,
        semantics,
        unit: unit_label(&units, metric_type),
        status: statuses.resolve(settings.default_status),
        reference_min: bounds.min(),
        reference_max: bounds.max(),
        primary_source: primary.most_common().unwrap_or_default().to_string(),
        sources_included: included,
    })
}

/// Upsert one summary and log the outcome
pub(crate) fn write_summary(
    store: &dyn Store,
    summary: PeriodSummary,
    user_id: &str,
    metric_type: &str,
    canonical_code: Option<String>,
    period: &Period,
) -> Result<UpsertOutcome, RollupError> {
    let record = summary.into_record(user_id, metric_type, canonical_code, period);
    let outcome = store.upsert_aggregate(record)?;
    debug!(
        user_id = %user_id,
        metric = %metric_type,
        period = %period,
        ?outcome,
        "Aggregate upserted"
    );
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, TimeZone, Utc};

    use crate::status::ProcessingStatus;
    use crate::types::RawMeasurement;

    pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    /// A measurement already through categorization
    pub fn categorized(
        metric: &str,
        value: &str,
        unit: &str,
        start: DateTime<Utc>,
        source: &str,
        code: Option<&str>,
    ) -> RawMeasurement {
        let mut m = RawMeasurement::new("u1", metric, value, unit, start, source);
        m.canonical_code = code.map(str::to_string);
        m.status = ProcessingStatus::Categorized;
        m
    }
}
