//! Hourly aggregation from categorized raw measurements

use std::sync::Arc;
use tracing::debug;

use super::{
    ensure_granularity, group_by_code, profile_of, summarize_measurements, write_summary,
    AggregationSettings, Aggregator,
};
use crate::error::RollupError;
use crate::period::{Granularity, Period};
use crate::store::{MeasurementStore, Store};

/// Folds one hour of raw measurements per canonical code
pub struct HourlyAggregator {
    store: Arc<dyn Store>,
    settings: AggregationSettings,
}

impl HourlyAggregator {
    pub fn new(store: Arc<dyn Store>, settings: AggregationSettings) -> Self {
        Self { store, settings }
    }
}

impl Aggregator for HourlyAggregator {
    fn granularity(&self) -> Granularity {
        Granularity::Hour
    }

    fn aggregate(
        &self,
        user_id: &str,
        metric_type: &str,
        period: &Period,
    ) -> Result<usize, RollupError> {
        ensure_granularity(Granularity::Hour, period)?;

        let rows: Vec<_> = self
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
