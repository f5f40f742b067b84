//! Metric profiles
//!
//! A profile tells the aggregators how a metric behaves: which rollup path it
//! follows, whether its values are summed or averaged, and which unit table
//! normalizes it.

use serde::{Deserialize, Serialize};

use crate::normalizer::UnitFamily;
use crate::period::Granularity;

/// Which chain of aggregators a metric flows through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricPath {
    /// hour -> day -> week / month
    Vital,
    /// day -> month -> quarter -> year
    Lab,
}

impl MetricPath {
    /// Granularities this path maintains, finest first
    pub fn granularities(&self) -> &'static [Granularity] {
        match self {
            MetricPath::Vital => &[
                Granularity::Hour,
                Granularity::Day,
                Granularity::Week,
                Granularity::Month,
            ],
            MetricPath::Lab => &[
                Granularity::Day,
                Granularity::Month,
                Granularity::Quarter,
                Granularity::Year,
            ],
        }
    }
}

/// How contributing values combine into a period value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Semantics {
    /// Counters: step count, active energy, workout duration/distance/calories
    Sum,
    /// Point-in-time readings: heart rate, blood pressure, lab values
    Average,
    /// Overlap-prone spans (sleep); summed per day after overlap resolution
    Duration,
}

impl Semantics {
    /// Whether the period value is the total rather than the mean
    pub fn is_additive(&self) -> bool {
        matches!(self, Semantics::Sum | Semantics::Duration)
    }
}

/// Aggregation behaviour of one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricProfile {
    pub path: MetricPath,
    pub semantics: Semantics,
    pub units: UnitFamily,
}

const SUM_KEYWORDS: &[&str] = &[
    "step",
    "active energy",
    "energy burned",
    "calories burned",
    "active calories",
    "workout duration",
    "workout distance",
    "workout calories",
    "exercise minutes",
    "exercise time",
    "active minutes",
    "flights climbed",
    "floors",
    "distance",
    "water intake",
];

const LAB_CATEGORIES: &[&str] = &["lab", "labs", "lab_result", "lab_results", "laboratory", "blood test"];

impl MetricProfile {
    /// Resolve the profile of a metric from its name, category hint and
    /// whether the measurement carries a lab reference range.
    pub fn resolve(metric_type: &str, category: Option<&str>, has_reference_range: bool) -> Self {
        let name = normalize_name(metric_type);
        let category = category.map(normalize_name).unwrap_or_default();
        let units = UnitFamily::for_metric(&name);

        let is_lab = has_reference_range || LAB_CATEGORIES.contains(&category.as_str());

        let semantics = if units == UnitFamily::DurationHours {
            Semantics::Duration
        } else if SUM_KEYWORDS.iter().any(|k| name.contains(k)) {
            Semantics::Sum
        } else {
            Semantics::Average
        };

        let path = if is_lab && semantics == Semantics::Average {
            MetricPath::Lab
        } else {
            MetricPath::Vital
        };

        MetricProfile {
            path,
            semantics,
            units,
        }
    }

    /// Whether the daily aggregate reads raw measurements instead of hourly rows
    pub fn daily_from_raw(&self) -> bool {
        self.path == MetricPath::Lab || self.semantics == Semantics::Duration
    }

    /// Granularities maintained for this metric, finest first
    pub fn granularities(&self) -> &'static [Granularity] {
        if self.semantics == Semantics::Duration {
            // Sleep is resolved per day; hourly slices would double count spans.
            &[Granularity::Day, Granularity::Week, Granularity::Month]
        } else {
            self.path.granularities()
        }
    }
}

/// Lowercase, trim and fold separators so "Heart_Rate" and "heart rate" agree
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
