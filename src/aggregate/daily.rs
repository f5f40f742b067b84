//! Daily aggregation
//!
//! The source of a daily row depends on the metric:
//! - vitals and counters fold the day's hourly rows
//! - lab results fold the day's raw measurements directly
//! - sleep folds the raw spans left after overlap resolution, attributed to
//!   the day the span starts. Overlaps are resolved against the neighbouring
//!   days too, so a duplicate recording that starts after midnight is not
//!   counted again on the next day.

use chrono::Duration;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::rollup::roll_up;
use super::{
    ensure_granularity, group_by_code, profile_of, summarize_measurements, write_summary,
    AggregationSettings, Aggregator, PeriodSummary, Stats, StatusTally, Tally,
};
use crate::error::RollupError;
use crate::metrics::Semantics;
use crate::overlap::OverlapResolver;
use crate::period::{Granularity, Period};
use crate::store::{AggregateStore, MeasurementStore, Store};
use crate::types::{AggregateKey, AggregateMode, RawMeasurement, StatValue};

/// Folds one day per canonical code
pub struct DailyAggregator {
    store: Arc<dyn Store>,
    settings: AggregationSettings,
    resolver: OverlapResolver,
}

impl DailyAggregator {
    pub fn new(store: Arc<dyn Store>, settings: AggregationSettings) -> Self {
        Self {
            store,
            resolver: OverlapResolver::new(settings.sleep_bounds),
            settings,
        }
    }

    /// Re-aggregate one day of sleep.
    ///
    /// Spans of the previous and next day take part in overlap resolution;
    /// only kept spans starting inside `period` count. A code whose spans were
    /// all absorbed by a neighbouring day loses its stale row.
    fn aggregate_sleep(
        &self,
        user_id: &str,
        metric_type: &str,
        period: &Period,
    ) -> Result<usize, RollupError> {
        let window: Vec<RawMeasurement> = self
            .store
            .measurements_between(
                user_id,
                metric_type,
                period.start.checked_sub_signed(Duration::days(1)).unwrap_or(period.start),
                period.end.checked_add_signed(Duration::days(1)).unwrap_or(period.end),
            )?
            .into_iter()
            .filter(|m| m.status.is_aggregatable())
            .collect();

        let mut written = 0;
        for (code, group) in group_by_code(window, |m| m.canonical_code.clone()) {
            match self.summarize_sleep(&group, metric_type, period) {
                Some(summary) => {
                    write_summary(self.store.as_ref(), summary, user_id, metric_type, code, period)?;
                    written += 1;
                }
                None => {
                    let key = AggregateKey {
                        granularity: Granularity::Day,
                        user_id: user_id.to_string(),
                        metric_type: metric_type.to_string(),
                        canonical_code: code,
                        period_key: period.key(),
                    };
                    if self.store.remove_aggregate(&key)? {
                        debug!(
                            user_id = %user_id,
                            metric = %metric_type,
                            period = %period,
                            "Removed sleep row with no kept spans"
                        );
                    }
                }
            }
        }
        Ok(written)
    }

    /// Total of the non-overlapping sleep spans starting inside `period`
    fn summarize_sleep(
        &self,
        rows: &[RawMeasurement],
        metric_type: &str,
        period: &Period,
    ) -> Option<PeriodSummary> {
        let mut resolved = self.resolver.resolve(rows);
        resolved.kept.retain(|s| period.contains(s.start));
        debug!(
            metric = %metric_type,
            period = %period,
            kept = resolved.kept.len(),
            excluded_awake = resolved.excluded_awake,
            discarded_noise = resolved.discarded_noise,
            dropped_overlaps = resolved.dropped_overlaps,
            "Resolved sleep spans"
        );

        let (min, max) = (resolved.min_hours()?, resolved.max_hours()?);
        let total = resolved.total_hours();
        let kept: HashSet<Uuid> = resolved.kept.iter().map(|s| s.measurement_id).collect();

        let mut statuses = StatusTally::default();
        for row in rows.iter().filter(|r| kept.contains(&r.id)) {
            statuses.add(row.clinical_status());
        }

        let mut sources = Tally::default();
        for span in &resolved.kept {
            sources.add(&span.source);
        }

        Some(PeriodSummary {
            stats: Stats {
                mode: AggregateMode::Numeric,
                count: resolved.kept.len() as u64,
                total: Some(total),
                // A single night's total, not a per-span mean
                average: Some(StatValue::Number(total)),
                min: StatValue::Number(min),
                max: StatValue::Number(max),
                distinct_values: Vec::new(),
            },
            semantics: Semantics::Duration,
            unit: "hours".to_string(),
            status: statuses.resolve(self.settings.default_status),
            reference_min: None,
            reference_max: None,
            primary_source: sources.most_common().unwrap_or_default().to_string(),
            sources_included: sources.keys().cloned().collect::<BTreeSet<_>>(),
        })
    }
}

impl Aggregator for DailyAggregator {
    fn granularity(&self) -> Granularity {
        Granularity::Day
    }

    fn aggregate(
        &self,
        user_id: &str,
        metric_type: &str,
        period: &Period,
    ) -> Result<usize, RollupError> {
        ensure_granularity(Granularity::Day, period)?;

        let rows: Vec<RawMeasurement> = self
            .store
            .measurements_between(user_id, metric_type, period.start, period.end)?
            .into_iter()
            .filter(|m| m.status.is_aggregatable())
            .collect();

        if rows.is_empty() {
            debug!(user_id = %user_id, metric = %metric_type, period = %period, "No source rows");
            return Ok(0);
        }

        let profile = profile_of(metric_type, &rows);
        if profile.semantics == Semantics::Duration {
            return self.aggregate_sleep(user_id, metric_type, period);
        }
        if !profile.daily_from_raw() {
            return roll_up(
                self.store.as_ref(),
                &self.settings,
                Granularity::Hour,
                user_id,
                metric_type,
                period,
            );
        }

        let mut written = 0;
        for (code, group) in group_by_code(rows, |m| m.canonical_code.clone()) {
            let Some(summary) = summarize_measurements(&group, metric_type, &profile, &self.settings)
            else {
                continue;
            };
            write_summary(self.store.as_ref(), summary, user_id, metric_type, code, period)?;
            written += 1;
        }

        Ok(written)
    }
}
