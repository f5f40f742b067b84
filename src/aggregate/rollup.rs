//! Higher-granularity rollups
//!
//! Weekly and monthly rows fold daily rows; quarterly rows fold monthly rows and
//! yearly rows fold quarterly rows. Reference range bounds are averaged across
//! the contributing rows so lab rollups keep a representative range.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{
    ensure_granularity, group_by_code, summarize_aggregates, write_summary, AggregationSettings,
    Aggregator,
};
use crate::error::RollupError;
use crate::period::{Granularity, Period};
use crate::store::{AggregateStore, Store};

/// Rolls the next lower granularity up into `target`
pub struct RollupAggregator {
    store: Arc<dyn Store>,
    settings: AggregationSettings,
    target: Granularity,
    lower: Granularity,
}

impl RollupAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        settings: AggregationSettings,
        target: Granularity,
    ) -> Result<Self, RollupError> {
        let lower = target
            .rollup_source()
            .ok_or(RollupError::UnsupportedRollup(target))?;
        Ok(Self {
            store,
            settings,
            target,
            lower,
        })
    }

    pub fn weekly(store: Arc<dyn Store>, settings: AggregationSettings) -> Self {
        Self::with_source(store, settings, Granularity::Week, Granularity::Day)
    }

    pub fn monthly(store: Arc<dyn Store>, settings: AggregationSettings) -> Self {
        Self::with_source(store, settings, Granularity::Month, Granularity::Day)
    }

    pub fn quarterly(store: Arc<dyn Store>, settings: AggregationSettings) -> Self {
        Self::with_source(store, settings, Granularity::Quarter, Granularity::Month)
    }

    pub fn yearly(store: Arc<dyn Store>, settings: AggregationSettings) -> Self {
        Self::with_source(store, settings, Granularity::Year, Granularity::Quarter)
    }

    fn with_source(
        store: Arc<dyn Store>,
        settings: AggregationSettings,
        target: Granularity,
        lower: Granularity,
    ) -> Self {
        Self {
            store,
            settings,
            target,
            lower,
        }
    }

    pub fn lower(&self) -> Granularity {
        self.lower
    }
}

impl Aggregator for RollupAggregator {
    fn granularity(&self) -> Granularity {
        self.target
    }

    fn aggregate(
        &self,
        user_id: &str,
        metric_type: &str,
        period: &Period,
    ) -> Result<usize, RollupError> {
        ensure_granularity(self.target, period)?;
        roll_up(
            self.store.as_ref(),
            &self.settings,
            self.lower,
            user_id,
            metric_type,
            period,
        )
    }
}

/// Fold the `lower` rows inside `period` and upsert one row per code.
///
/// Rows of `period` whose code no longer has lower rows are removed.
pub(crate) fn roll_up(
    store: &dyn Store,
    settings: &AggregationSettings,
    lower: Granularity,
    user_id: &str,
    metric_type: &str,
    period: &Period,
) -> Result<usize, RollupError> {
    let rows = store.aggregates_between(lower, user_id, metric_type, period.start, period.end)?;
    if rows.is_empty() {
        debug!(user_id = %user_id, metric = %metric_type, period = %period, "No {} rows", lower);
    }

    let mut written = 0;
    let mut live = HashSet::new();
    for (code, group) in group_by_code(rows, |r| r.canonical_code.clone()) {
        let Some(summary) = summarize_aggregates(&group, metric_type, settings) else {
            continue;
        };
        live.insert(code.clone());
        write_summary(store, summary, user_id, metric_type, code, period)?;
        written += 1;
    }

    let existing =
        store.aggregates_between(period.granularity, user_id, metric_type, period.start, period.end)?;
    for stale in existing.iter().filter(|r| !live.contains(&r.canonical_code)) {
        store.remove_aggregate(&stale.key())?;
        debug!(
            user_id = %user_id,
            metric = %metric_type,
            period = %period,
            "Removed {} row with no {} rows",
            period.granularity,
            lower
        );
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::at;
    use crate::aggregate::PeriodSummary;
    use crate::metrics::Semantics;
    use crate::status::ClinicalStatus;
    use crate::store::{AggregateStore, MemoryStore};
    use crate::types::{AggregateMode, AggregateRecord, StatValue};
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn numeric_row(
        granularity: Granularity,
        ts: DateTime<Utc>,
        semantics: Semantics,
        count: u64,
        average: f64,
        min: f64,
        max: f64,
    ) -> AggregateRecord {
        let total = semantics.is_additive().then_some(average * count as f64);
        PeriodSummary {
            stats: crate::aggregate::Stats {
                mode: AggregateMode::Numeric,
                count,
                total,
                average: Some(StatValue::Number(average)),
                min: StatValue::Number(min),
                max: StatValue::Number(max),
                distinct_values: Vec::new(),
            },
            semantics,
            unit: "U/L".to_string(),
            status: ClinicalStatus::Green,
            reference_min: Some(7.0),
            reference_max: Some(56.0),
            primary_source: "lab_upload".to_string(),
            sources_included: BTreeSet::from(["lab_upload".to_string()]),
        }
        .into_record("u1", "ALT", Some("1742-6".to_string()), &Period::containing(granularity, ts))
    }

    fn store_with(rows: Vec<AggregateRecord>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for row in rows {
            store.upsert_aggregate(row).unwrap();
        }
        store
    }

    fn ymd(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_weekly_average_is_count_weighted() {
        let store = store_with(vec![
            numeric_row(Granularity::Day, at(15, 0, 0), Semantics::Average, 2, 70.0, 60.0, 80.0),
            numeric_row(Granularity::Day, at(16, 0, 0), Semantics::Average, 2, 80.0, 75.0, 85.0),
        ]);
        let weekly = RollupAggregator::weekly(store.clone(), AggregationSettings::default());
        let week = Period::containing(Granularity::Week, at(15, 0, 0));

        assert_eq!(weekly.aggregate("u1", "ALT", &week).unwrap(), 1);

        let row = store
            .aggregates_between(Granularity::Week, "u1", "ALT", week.start, week.end)
            .unwrap()
            .remove(0);
        assert_eq!(row.period_key, "2024-W03");
        assert_eq!(row.count, 4);
        assert_eq!(row.average_value, Some(StatValue::Number(75.0)));
        assert_eq!(row.min_value, StatValue::Number(60.0));
        assert_eq!(row.max_value, StatValue::Number(85.0));
        assert_eq!(row.status, ClinicalStatus::Green);
    }

    #[test]
    fn test_monthly_sum_adds_daily_totals() {
        let store = store_with(vec![
            numeric_row(Granularity::Day, at(1, 0, 0), Semantics::Sum, 1, 8000.0, 8000.0, 8000.0),
            numeric_row(Granularity::Day, at(2, 0, 0), Semantics::Sum, 1, 4000.0, 4000.0, 4000.0),
        ]);
        let monthly = RollupAggregator::monthly(store.clone(), AggregationSettings::default());
        let month = Period::containing(Granularity::Month, at(1, 0, 0));
        monthly.aggregate("u1", "ALT", &month).unwrap();

        let row = &store.all_aggregates()[2];
        assert_eq!(row.granularity, Granularity::Month);
        assert_eq!(row.total_value, Some(12000.0));
        assert_eq!(row.average_value, Some(StatValue::Number(6000.0)));
        assert_eq!(row.min_value, StatValue::Number(4000.0));
        assert_eq!(row.max_value, StatValue::Number(8000.0));
    }

    #[test]
    fn test_quarterly_and_yearly_average_reference_bounds() {
        let mut feb = numeric_row(Granularity::Month, ymd(2024, 2, 1), Semantics::Average, 1, 40.0, 40.0, 40.0);
        feb.reference_min = Some(9.0);
        feb.reference_max = Some(60.0);
        let store = store_with(vec![
            numeric_row(Granularity::Month, ymd(2024, 1, 1), Semantics::Average, 1, 30.0, 30.0, 30.0),
            feb,
        ]);

        let quarterly = RollupAggregator::quarterly(store.clone(), AggregationSettings::default());
        let q1 = Period::containing(Granularity::Quarter, ymd(2024, 1, 1));
        assert_eq!(quarterly.aggregate("u1", "ALT", &q1).unwrap(), 1);

        let yearly = RollupAggregator::yearly(store.clone(), AggregationSettings::default());
        let year = Period::containing(Granularity::Year, ymd(2024, 6, 1));
        assert_eq!(yearly.aggregate("u1", "ALT", &year).unwrap(), 1);

        let rows = store
            .aggregates_between(Granularity::Year, "u1", "ALT", year.start, year.end)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].period_key, "2024");
        assert_eq!(rows[0].reference_min, Some(8.0));
        assert_eq!(rows[0].reference_max, Some(58.0));
        assert_eq!(rows[0].average_value, Some(StatValue::Number(35.0)));
    }

    #[test]
    fn test_categorical_rows_roll_up_as_union() {
        let mut text = numeric_row(Granularity::Day, at(16, 0, 0), Semantics::Average, 1, 0.0, 0.0, 0.0);
        text.mode = AggregateMode::Single;
        text.average_value = Some(StatValue::Text("High".to_string()));
        text.min_value = StatValue::Text("High".to_string());
        text.max_value = StatValue::Text("High".to_string());
        text.distinct_values = vec!["High".to_string()];
        text.status = ClinicalStatus::Amber;

        let store = store_with(vec![
            numeric_row(Granularity::Day, at(15, 0, 0), Semantics::Average, 1, 45.0, 45.0, 45.0),
            text,
        ]);
        let weekly = RollupAggregator::weekly(store.clone(), AggregationSettings::default());
        let week = Period::containing(Granularity::Week, at(15, 0, 0));
        weekly.aggregate("u1", "ALT", &week).unwrap();

        let row = store
            .aggregates_between(Granularity::Week, "u1", "ALT", week.start, week.end)
            .unwrap()
            .remove(0);
        assert_eq!(row.mode, AggregateMode::Categorical);
        assert_eq!(row.average_value, Some(StatValue::Text("45, High".to_string())));
        assert_eq!(row.status, ClinicalStatus::Amber);
    }

    #[test]
    fn test_no_lower_rows() {
        let store = store_with(Vec::new());
        let weekly = RollupAggregator::weekly(store.clone(), AggregationSettings::default());
        let week = Period::containing(Granularity::Week, at(15, 0, 0));
        assert_eq!(weekly.aggregate("u1", "ALT", &week).unwrap(), 0);
        assert_eq!(store.aggregate_count(), 0);
    }

    #[test]
    fn test_row_without_lower_rows_is_removed() {
        let store = store_with(vec![
            numeric_row(Granularity::Day, at(15, 0, 0), Semantics::Duration, 1, 8.0, 8.0, 8.0),
            numeric_row(Granularity::Day, at(16, 0, 0), Semantics::Duration, 1, 2.0, 2.0, 2.0),
        ]);
        let weekly = RollupAggregator::weekly(store.clone(), AggregationSettings::default());
        let week = Period::containing(Granularity::Week, at(15, 0, 0));
        weekly.aggregate("u1", "ALT", &week).unwrap();

        // Every day row of the week disappears
        for day in store.aggregates_between(Granularity::Day, "u1", "ALT", week.start, week.end).unwrap() {
            store.remove_aggregate(&day.key()).unwrap();
        }
        assert_eq!(weekly.aggregate("u1", "ALT", &week).unwrap(), 0);
        assert_eq!(store.aggregate_count(), 0);
    }

    #[test]
    fn test_new_rejects_raw_sourced_granularities() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert!(RollupAggregator::new(store.clone(), AggregationSettings::default(), Granularity::Hour).is_err());
        let quarterly =
            RollupAggregator::new(store, AggregationSettings::default(), Granularity::Quarter).unwrap();
        assert_eq!(quarterly.lower(), Granularity::Month);
    }
}
