//! Statistics folding shared by every aggregator
//!
//! Inputs are folded in a deterministic order so re-running an aggregation on
//! unchanged data reproduces the exact same floating point results.

use std::collections::{BTreeMap, BTreeSet};

use crate::coerce::{format_number, Coerced};
use crate::metrics::Semantics;
use crate::status::ClinicalStatus;
use crate::types::{AggregateMode, AggregateRecord, StatValue};

/// Separator between distinct values in categorical aggregates
pub const CATEGORICAL_SEPARATOR: &str = ", ";

/// Final statistics of one period
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub mode: AggregateMode,
    pub count: u64,
    pub total: Option<f64>,
    pub average: Option<StatValue>,
    pub min: StatValue,
    pub max: StatValue,
    pub distinct_values: Vec<String>,
}

/// Accumulates values (raw level) or lower-level aggregates (rollup level)
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    semantics: Semantics,
    /// Raw observations represented
    count: u64,
    /// Contributing rows (values or lower aggregates)
    rows: u64,
    total: f64,
    /// Sum of value * weight, for count-weighted means
    weighted: f64,
    min: Option<f64>,
    max: Option<f64>,
    all_numeric: bool,
    distinct: BTreeSet<String>,
}

impl StatsAccumulator {
    pub fn new(semantics: Semantics) -> Self {
        Self {
            semantics,
            count: 0,
            rows: 0,
            total: 0.0,
            weighted: 0.0,
            min: None,
            max: None,
            all_numeric: true,
            distinct: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Fold one raw value
    pub fn add_value(&mut self, value: &Coerced) {
        self.count += 1;
        self.rows += 1;
        self.distinct.insert(value.display_text());

        match value {
            Coerced::Numeric(v) => {
                self.total += v;
                self.weighted += v;
                self.observe_extremes(*v, *v);
            }
            Coerced::NonNumeric(_) => self.all_numeric = false,
        }
    }

    /// Fold one lower-granularity aggregate
    pub fn add_aggregate(&mut self, lower: &AggregateRecord) {
        self.count += lower.count;
        self.rows += 1;

        let numeric = match lower.mode {
            AggregateMode::Numeric => numeric_parts(lower),
            AggregateMode::Single | AggregateMode::Categorical => None,
        };

        let Some((total, average, min, max)) = numeric else {
            self.all_numeric = false;
            self.distinct.extend(lower.distinct_values.iter().cloned());
            if lower.distinct_values.is_empty() {
                self.distinct.insert(lower.value().to_string());
            }
            return;
        };

        if self.semantics.is_additive() {
            // Extremes are per sub-period totals
            self.total += total;
            self.weighted += total;
            self.observe_extremes(total, total);
            self.distinct.insert(format_number(total));
        } else {
            self.total += total;
            self.weighted += average * lower.count as f64;
            self.observe_extremes(min, max);
            self.distinct.insert(format_number(average));
        }
    }

    fn observe_extremes(&mut self, low: f64, high: f64) {
        self.min = Some(self.min.map_or(low, |m| m.min(low)));
        self.max = Some(self.max.map_or(high, |m| m.max(high)));
    }

    /// Finish the fold; `None` when nothing was added
    pub fn finish(self, max_text_len: usize) -> Option<Stats> {
        if self.rows == 0 {
            return None;
        }

        if self.all_numeric {
            let (min, max) = (self.min?, self.max?);
            let (total, average) = if self.semantics.is_additive() {
                (Some(self.total), self.total / self.rows as f64)
            } else {
                (None, self.weighted / self.count.max(1) as f64)
            };
            return Some(Stats {
                mode: AggregateMode::Numeric,
                count: self.count,
                total,
                average: Some(StatValue::Number(average)),
                min: StatValue::Number(min),
                max: StatValue::Number(max),
                distinct_values: Vec::new(),
            });
        }

        let distinct: Vec<String> = self.distinct.into_iter().collect();

        if distinct.len() == 1 {
            let only = StatValue::Text(truncate(&distinct[0], max_text_len));
            return Some(Stats {
                mode: AggregateMode::Single,
                count: self.count,
                total: None,
                average: Some(only.clone()),
                min: only.clone(),
                max: only,
                distinct_values: distinct,
            });
        }

        let joined = truncate(&distinct.join(CATEGORICAL_SEPARATOR), max_text_len);
        let shortest = distinct
            .iter()
            .min_by(|a, b| a.chars().count().cmp(&b.chars().count()).then(a.cmp(b)))
            .cloned()
            .unwrap_or_default();
        let longest = distinct
            .iter()
            .max_by(|a, b| a.chars().count().cmp(&b.chars().count()).then(a.cmp(b)))
            .cloned()
            .unwrap_or_default();

        Some(Stats {
            mode: AggregateMode::Categorical,
            count: self.count,
            total: None,
            average: Some(StatValue::Text(joined)),
            min: StatValue::Text(truncate(&shortest, max_text_len)),
            max: StatValue::Text(truncate(&longest, max_text_len)),
            distinct_values: distinct,
        })
    }
}

fn numeric_parts(lower: &AggregateRecord) -> Option<(f64, f64, f64, f64)> {
    let average = lower.average_value.as_ref()?.as_f64()?;
    let min = lower.min_value.as_f64()?;
    let max = lower.max_value.as_f64()?;
    let total = lower.total_value.unwrap_or(average * lower.count as f64);
    Some((total, average, min, max))
}

/// Cut at a char boundary so the stored string never exceeds `max_len` chars
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    s.chars().take(max_len).collect()
}

/// Tally of contributing clinical statuses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusTally {
    pub green: usize,
    pub amber: usize,
    pub red: usize,
    pub unknown: usize,
}

impl StatusTally {
    pub fn add(&mut self, status: Option<ClinicalStatus>) {
        match status {
            Some(ClinicalStatus::Green) => self.green += 1,
            Some(ClinicalStatus::Amber) => self.amber += 1,
            Some(ClinicalStatus::Red) => self.red += 1,
            None => self.unknown += 1,
        }
    }

    /// Red wins; green only when every contribution was green; amber for any
    /// other mix; `default` when nothing carried status information.
    pub fn resolve(&self, default: ClinicalStatus) -> ClinicalStatus {
        let known = self.green + self.amber + self.red;
        if self.red > 0 {
            ClinicalStatus::Red
        } else if known == 0 {
            default
        } else if self.green == known && self.unknown == 0 {
            ClinicalStatus::Green
        } else {
            ClinicalStatus::Amber
        }
    }
}

/// Frequency count with deterministic "most common" selection
#[derive(Debug, Clone, Default)]
pub struct Tally {
    counts: BTreeMap<String, usize>,
}

impl Tally {
    pub fn add(&mut self, item: &str) {
        *self.counts.entry(item.to_string()).or_insert(0) += 1;
    }

    pub fn add_n(&mut self, item: &str, n: usize) {
        *self.counts.entry(item.to_string()).or_insert(0) += n;
    }

    /// Most frequent item; ties go to the lexicographically smallest
    pub fn most_common(&self) -> Option<&str> {
        self.counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(k, _)| k.as_str())
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.counts.keys()
    }
}

/// Running mean of reference range bounds
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundsMean {
    min_sum: f64,
    min_n: u32,
    max_sum: f64,
    max_n: u32,
}

impl BoundsMean {
    pub fn add(&mut self, min: Option<f64>, max: Option<f64>) {
        if let Some(v) = min {
            self.min_sum += v;
            self.min_n += 1;
        }
        if let Some(v) = max {
            self.max_sum += v;
            self.max_n += 1;
        }
    }

    pub fn min(&self) -> Option<f64> {
        (self.min_n > 0).then(|| self.min_sum / self.min_n as f64)
    }

    pub fn max(&self) -> Option<f64> {
        (self.max_n > 0).then(|| self.max_sum / self.max_n as f64)
    }
}
