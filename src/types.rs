//! Core types for the Synheart Rollup engine
//!
//! This module defines the records that flow through the engine: raw
//! measurements, per-period aggregates, canonical code mappings and the
//! read-side views handed to dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::coerce::{coerce, format_number, Coerced};
use crate::metrics::{MetricProfile, Semantics};
use crate::period::{Granularity, Period};
use crate::reference_range::ReferenceRange;
use crate::schema::ValidationError;
use crate::status::{ClinicalStatus, ProcessingStatus};

/// A single submitted vital-sign or lab measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    pub id: Uuid,
    pub user_id: String,
    pub metric_type: String,
    /// Raw value, preserved as submitted
    pub value: String,
    pub unit: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Submitting system (e.g. "apple_health", "manual", "lab_upload")
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Category hint ("vitals", "activity", "sleep", "lab_result", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-text lab reference range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    /// Device or lab supplied flag ("High", "Normal", "Critical")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_flag: Option<String>,
    #[serde(default)]
    pub canonical_code: Option<String>,
    pub status: ProcessingStatus,
    /// Number of processing attempts that ended in failure
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RawMeasurement {
    /// Create a new PENDING measurement
    pub fn new(
        user_id: impl Into<String>,
        metric_type: impl Into<String>,
        value: impl Into<String>,
        unit: impl Into<String>,
        start_time: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        RawMeasurement {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            metric_type: metric_type.into(),
            value: value.into(),
            unit: unit.into(),
            start_time,
            end_time: None,
            source: source.into(),
            device: None,
            notes: None,
            confidence: None,
            category: None,
            reference_range: None,
            status_flag: None,
            canonical_code: None,
            status: ProcessingStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_reference_range(mut self, range: impl Into<String>) -> Self {
        self.reference_range = Some(range.into());
        self
    }

    pub fn with_status_flag(mut self, flag: impl Into<String>) -> Self {
        self.status_flag = Some(flag.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Natural key used to recognize a resubmitted reading
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            user_id: self.user_id.clone(),
            metric_type: self.metric_type.clone(),
            unit: self.unit.clone(),
            start_time: self.start_time,
            source: self.source.clone(),
            notes: self.notes.clone(),
        }
    }

    /// Check the record is processable
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("user_id".to_string()));
        }
        if self.metric_type.trim().is_empty() {
            return Err(ValidationError::MissingField("metric_type".to_string()));
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(ValidationError::InvertedSpan {
                    start: self.start_time.to_rfc3339(),
                    end: end.to_rfc3339(),
                });
            }
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ValidationError::ConfidenceOutOfRange(confidence));
            }
        }
        Ok(())
    }

    pub fn profile(&self) -> MetricProfile {
        MetricProfile::resolve(
            &self.metric_type,
            self.category.as_deref(),
            self.reference_range.is_some(),
        )
    }

    pub fn coerced_value(&self) -> Coerced {
        coerce(&self.value)
    }

    pub fn parsed_reference_range(&self) -> ReferenceRange {
        self.reference_range
            .as_deref()
            .map(ReferenceRange::parse)
            .unwrap_or_default()
    }

    /// Clinical status this single record contributes, if it carries any.
    ///
    /// An explicit flag wins, then a numeric value checked against the
    /// reference range, then a non-numeric value that is itself a flag word.
    pub fn clinical_status(&self) -> Option<ClinicalStatus> {
        if let Some(status) = self.status_flag.as_deref().and_then(ClinicalStatus::from_flag) {
            return Some(status);
        }

        match self.coerced_value() {
            Coerced::Numeric(v) => self.parsed_reference_range().classify(v),
            Coerced::NonNumeric(text) => ClinicalStatus::from_flag(&text),
        }
    }

    /// Bucket of `granularity` containing the record's start time
    pub fn period(&self, granularity: Granularity) -> Period {
        Period::containing(granularity, self.start_time)
    }
}

/// Dedup key: `(user_id, metric_type, unit, start_time, source, notes)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: String,
    pub metric_type: String,
    pub unit: String,
    pub start_time: DateTime<Utc>,
    pub source: String,
    pub notes: Option<String>,
}

/// Numeric statistic or its categorical string stand-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Number(f64),
    Text(String),
}

impl StatValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatValue::Number(v) => Some(*v),
            StatValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StatValue::Text(s) => Some(s),
            StatValue::Number(_) => None,
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Number(v) => f.write_str(&format_number(*v)),
            StatValue::Text(s) => f.write_str(s),
        }
    }
}

/// How an aggregate's statistics were computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMode {
    /// Every contributing value was numeric
    Numeric,
    /// Mixed or non-numeric inputs with a single distinct value, stored verbatim
    Single,
    /// Distinct values joined into a bounded string
    Categorical,
}

/// Natural composite key of an aggregate row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub granularity: Granularity,
    pub user_id: String,
    pub metric_type: String,
    pub canonical_code: Option<String>,
    pub period_key: String,
}

/// Statistical rollup of one metric over one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub id: Uuid,
    pub granularity: Granularity,
    pub user_id: String,
    pub metric_type: String,
    pub canonical_code: Option<String>,
    pub period_key: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub semantics: Semantics,
    pub mode: AggregateMode,
    /// Raw observations folded into this row
    pub count: u64,
    pub total_value: Option<f64>,
    pub average_value: Option<StatValue>,
    pub min_value: StatValue,
    pub max_value: StatValue,
    /// Sorted distinct values; populated outside numeric mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distinct_values: Vec<String>,
    pub unit: String,
    pub status: ClinicalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_max: Option<f64>,
    pub primary_source: String,
    pub sources_included: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregateRecord {
    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            granularity: self.granularity,
            user_id: self.user_id.clone(),
            metric_type: self.metric_type.clone(),
            canonical_code: self.canonical_code.clone(),
            period_key: self.period_key.clone(),
        }
    }

    /// Headline value: the total for additive metrics, the mean otherwise
    pub fn value(&self) -> StatValue {
        match (self.mode, self.semantics.is_additive(), self.total_value) {
            (AggregateMode::Numeric, true, Some(total)) => StatValue::Number(total),
            _ => self
                .average_value
                .clone()
                .unwrap_or_else(|| self.min_value.clone()),
        }
    }

    /// Equal statistics, ignoring identity and bookkeeping timestamps
    pub fn same_content(&self, other: &AggregateRecord) -> bool {
        self.key() == other.key()
            && self.semantics == other.semantics
            && self.mode == other.mode
            && self.count == other.count
            && self.total_value == other.total_value
            && self.average_value == other.average_value
            && self.min_value == other.min_value
            && self.max_value == other.max_value
            && self.distinct_values == other.distinct_values
            && self.unit == other.unit
            && self.status == other.status
            && self.reference_min == other.reference_min
            && self.reference_max == other.reference_max
            && self.primary_source == other.primary_source
            && self.sources_included == other.sources_included
    }

    pub fn view(&self) -> AggregateView {
        AggregateView {
            granularity: self.granularity,
            period: self.period_key.clone(),
            metric_type: self.metric_type.clone(),
            canonical_code: self.canonical_code.clone(),
            value: self.value(),
            min: self.min_value.clone(),
            max: self.max_value.clone(),
            count: self.count,
            unit: self.unit.clone(),
            status: self.status,
            reference_min: self.reference_min,
            reference_max: self.reference_max,
            primary_source: self.primary_source.clone(),
            sources_included: self.sources_included.iter().cloned().collect(),
        }
    }
}

/// Read-side projection of an aggregate for dashboards and charts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateView {
    pub granularity: Granularity,
    pub period: String,
    pub metric_type: String,
    pub canonical_code: Option<String>,
    pub value: StatValue,
    pub min: StatValue,
    pub max: StatValue,
    pub count: u64,
    pub unit: String,
    pub status: ClinicalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_max: Option<f64>,
    pub primary_source: String,
    pub sources_included: Vec<String>,
}

/// Where a canonical mapping came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    /// Seed table shipped with the engine
    Builtin,
    /// Curated mapping table
    Table,
    /// Learned from the inference collaborator
    Inferred,
}

/// Metric name to canonical clinical code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMapping {
    pub metric_name: String,
    pub canonical_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub source_of_mapping: MappingSource,
}

/// Per-state record counts for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub categorized: usize,
    pub aggregated: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: ProcessingStatus) {
        let slot = match status {
            ProcessingStatus::Pending => &mut self.pending,
            ProcessingStatus::Queued => &mut self.queued,
            ProcessingStatus::Processing => &mut self.processing,
            ProcessingStatus::Categorized => &mut self.categorized,
            ProcessingStatus::Aggregated => &mut self.aggregated,
            ProcessingStatus::Completed => &mut self.completed,
            ProcessingStatus::Failed => &mut self.failed,
            ProcessingStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += 1;
    }

    pub fn get(&self, status: ProcessingStatus) -> usize {
        match status {
            ProcessingStatus::Pending => self.pending,
            ProcessingStatus::Queued => self.queued,
            ProcessingStatus::Processing => self.processing,
            ProcessingStatus::Categorized => self.categorized,
            ProcessingStatus::Aggregated => self.aggregated,
            ProcessingStatus::Completed => self.completed,
            ProcessingStatus::Failed => self.failed,
            ProcessingStatus::DeadLetter => self.dead_letter,
        }
    }

    pub fn total(&self) -> usize {
        ProcessingStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
