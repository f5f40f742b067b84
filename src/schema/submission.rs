//! health.measurement.v1 submission schema
//!
//! The wire shape delivered by the submission intake. Timestamps stay textual
//! here so that one malformed record is reported on its own instead of failing
//! the whole payload.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RawMeasurement;

/// Current schema version
pub const SCHEMA_VERSION: &str = "health.measurement.v1";

/// One submitted measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSubmission {
    /// Schema version identifier; assumed current when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    pub user_id: String,
    pub metric_type: String,
    /// Number or text; preserved as text
    pub value: serde_json::Value,
    #[serde(default)]
    pub unit: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_flag: Option<String>,
}

impl MeasurementSubmission {
    /// Validate the submission and convert it into a PENDING measurement
    pub fn to_measurement(&self) -> Result<RawMeasurement, ValidationError> {
        if let Some(version) = &self.schema_version {
            if version != SCHEMA_VERSION {
                return Err(ValidationError::InvalidSchemaVersion {
                    expected: SCHEMA_VERSION.to_string(),
                    actual: version.clone(),
                });
            }
        }

        let value = match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => return Err(ValidationError::MissingField("value".to_string())),
            other => other.to_string(),
        };

        let start_time = parse_timestamp("start_time", &self.start_time)?;
        let mut measurement = RawMeasurement::new(
            self.user_id.clone(),
            self.metric_type.clone(),
            value,
            self.unit.clone(),
            start_time,
            self.source.clone(),
        );

        if let Some(end) = &self.end_time {
            measurement.end_time = Some(parse_timestamp("end_time", end)?);
        }
        measurement.device = self.device.clone();
        measurement.notes = self.notes.clone();
        measurement.confidence = self.confidence;
        measurement.category = self.category.clone();
        measurement.reference_range = self.reference_range.clone();
        measurement.status_flag = self.status_flag.clone();

        measurement.validate()?;
        Ok(measurement)
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS` (UTC) and bare dates
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let s = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }

    Err(ValidationError::InvalidTimestamp {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

/// Validation errors for submissions and measurements
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid timestamp in {field}: '{value}'")]
    InvalidTimestamp { field: String, value: String },

    #[error("End time {end} precedes start time {start}")]
    InvertedSpan { start: String, end: String },

    #[error("Confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
}
