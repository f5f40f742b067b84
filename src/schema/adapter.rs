//! Adapter for converting health.measurement.v1 submissions to raw measurements
//!
//! Handles JSON array and NDJSON payloads, and reports validation problems per
//! submission index so a bulk upload can be partially accepted.

use crate::error::RollupError;
use crate::schema::submission::*;
use crate::types::RawMeasurement;

/// Adapter for converting submissions to raw measurements
pub struct SubmissionAdapter;

impl SubmissionAdapter {
    /// Parse a JSON string containing an array of submissions
    pub fn parse_array(json: &str) -> Result<Vec<MeasurementSubmission>, RollupError> {
        let submissions: Vec<MeasurementSubmission> = serde_json::from_str(json)?;
        Ok(submissions)
    }

    /// Parse NDJSON (newline-delimited JSON) containing submissions
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<MeasurementSubmission>, RollupError> {
        let mut submissions = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<MeasurementSubmission>(trimmed) {
                Ok(submission) => submissions.push(submission),
                Err(e) => {
                    return Err(RollupError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(submissions)
    }

    /// Convert every submission, failing on the first invalid one
    pub fn to_measurements(
        submissions: &[MeasurementSubmission],
    ) -> Result<Vec<RawMeasurement>, RollupError> {
        submissions
            .iter()
            .map(|s| s.to_measurement().map_err(RollupError::from))
            .collect()
    }

    /// Convert the valid submissions and report the rest
    pub fn partition(
        submissions: &[MeasurementSubmission],
    ) -> (Vec<RawMeasurement>, Vec<ValidationResult>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for (index, submission) in submissions.iter().enumerate() {
            match submission.to_measurement() {
                Ok(measurement) => accepted.push(measurement),
                Err(error) => rejected.push(ValidationResult {
                    index,
                    user_id: submission.user_id.clone(),
                    metric_type: submission.metric_type.clone(),
                    error,
                }),
            }
        }

        (accepted, rejected)
    }

    /// Validate a batch of submissions, returning only the failures
    pub fn validate_submissions(submissions: &[MeasurementSubmission]) -> Vec<ValidationResult> {
        Self::partition(submissions).1
    }
}

/// A submission that failed validation
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub index: usize,
    pub user_id: String,
    pub metric_type: String,
    pub error: ValidationError,
}
