//! Sleep overlap resolution
//!
//! Several devices often record the same night. Summing their spans double
//! counts sleep, so overlapping spans are collapsed to the longest one before
//! the daily total is computed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::coerce::Coerced;
use crate::normalizer::{UnitFamily, UnitNormalizer};
use crate::types::RawMeasurement;

/// Annotations marking a span as not asleep
const NON_SLEEP_MARKERS: &[&str] = &["awake", "out of bed", "not asleep"];

/// Plausible single-span sleep duration, in hours
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SleepBounds {
    pub min_hours: f64,
    pub max_hours: f64,
}

impl Default for SleepBounds {
    fn default() -> Self {
        Self {
            min_hours: 0.1,
            max_hours: 16.0,
        }
    }
}

/// One accepted sleep interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepSpan {
    pub measurement_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hours: f64,
    pub source: String,
}

impl SleepSpan {
    fn intersects(&self, other: &SleepSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Outcome of resolving one user-day of sleep entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSleep {
    pub kept: Vec<SleepSpan>,
    pub excluded_awake: usize,
    pub discarded_noise: usize,
    pub dropped_overlaps: usize,
}

impl ResolvedSleep {
    pub fn total_hours(&self) -> f64 {
        self.kept.iter().map(|s| s.hours).sum()
    }

    pub fn min_hours(&self) -> Option<f64> {
        self.kept.iter().map(|s| s.hours).reduce(f64::min)
    }

    pub fn max_hours(&self) -> Option<f64> {
        self.kept.iter().map(|s| s.hours).reduce(f64::max)
    }
}

/// Resolver for overlapping sleep spans
pub struct OverlapResolver {
    bounds: SleepBounds,
}

impl Default for OverlapResolver {
    fn default() -> Self {
        Self::new(SleepBounds::default())
    }
}

impl OverlapResolver {
    pub fn new(bounds: SleepBounds) -> Self {
        Self { bounds }
    }

    /// Deduplicate the sleep entries of one user-day
    pub fn resolve(&self, entries: &[RawMeasurement]) -> ResolvedSleep {
        let mut resolved = ResolvedSleep::default();
        let mut candidates = Vec::new();

        for entry in entries {
            if is_non_sleep(entry) {
                resolved.excluded_awake += 1;
                continue;
            }
            match to_span(entry, &self.bounds) {
                Some(span) => candidates.push(span),
                None => resolved.discarded_noise += 1,
            }
        }

        candidates.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(a.end.cmp(&b.end))
                .then(a.measurement_id.cmp(&b.measurement_id))
        });

        for span in candidates {
            let longest_overlap = resolved
                .kept
                .iter()
                .filter(|kept| kept.intersects(&span))
                .map(|kept| kept.hours)
                .reduce(f64::max);

            match longest_overlap {
                None => resolved.kept.push(span),
                Some(longest) if span.hours > longest => {
                    let before = resolved.kept.len();
                    resolved.kept.retain(|kept| !kept.intersects(&span));
                    resolved.dropped_overlaps += before - resolved.kept.len();
                    resolved.kept.push(span);
                }
                Some(_) => resolved.dropped_overlaps += 1,
            }
        }

        resolved.kept.sort_by(|a, b| a.start.cmp(&b.start));
        resolved
    }
}

fn is_non_sleep(entry: &RawMeasurement) -> bool {
    let annotated = [entry.notes.as_deref(), entry.status_flag.as_deref()]
        .into_iter()
        .flatten()
        .chain(match entry.coerced_value() {
            Coerced::NonNumeric(_) => Some(entry.value.as_str()),
            Coerced::Numeric(_) => None,
        });

    annotated.into_iter().any(|text| {
        let text = text.to_lowercase();
        NON_SLEEP_MARKERS.iter().any(|m| text.contains(m))
    })
}

/// Duration from the value (normalized to hours), else from the span bounds.
///
/// `None` when no plausible duration can be derived.
fn to_span(entry: &RawMeasurement, bounds: &SleepBounds) -> Option<SleepSpan> {
    let from_value = entry.coerced_value().as_f64().and_then(|v| {
        let n = UnitNormalizer::normalize_in(UnitFamily::DurationHours, v, &entry.unit);
        if !n.recognized {
            warn!(
                measurement_id = %entry.id,
                unit = %entry.unit,
                has_end_time = entry.end_time.is_some(),
                "Unrecognized sleep unit, value ignored in favour of span bounds"
            );
        }
        n.recognized.then_some(n.value)
    });
    let from_bounds = entry
        .end_time
        .map(|end| (end - entry.start_time).num_seconds() as f64 / 3600.0);

    let hours = from_value.or(from_bounds)?;
    if !hours.is_finite() || hours < bounds.min_hours || hours > bounds.max_hours {
        return None;
    }

    let end = match entry.end_time {
        Some(end) => end,
        None => Duration::try_seconds((hours * 3600.0) as i64)
            .and_then(|d| entry.start_time.checked_add_signed(d))?,
    };

    Some(SleepSpan {
        measurement_id: entry.id,
        start: entry.start_time,
        end,
        hours,
        source: entry.source.clone(),
    })
}
