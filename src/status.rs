//! Processing and clinical status enumerations
//!
//! `ProcessingStatus` is the per-measurement lifecycle used by the status
//! tracker. `ClinicalStatus` is the green/amber/red classification carried by
//! aggregates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a raw measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    /// Sub-state of `Pending`: handed to an asynchronous worker
    Queued,
    Processing,
    Categorized,
    Aggregated,
    Completed,
    Failed,
    /// Terminal: retried too many times
    DeadLetter,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 8] = [
        ProcessingStatus::Pending,
        ProcessingStatus::Queued,
        ProcessingStatus::Processing,
        ProcessingStatus::Categorized,
        ProcessingStatus::Aggregated,
        ProcessingStatus::Completed,
        ProcessingStatus::Failed,
        ProcessingStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Categorized => "categorized",
            ProcessingStatus::Aggregated => "aggregated",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::DeadLetter => "dead_letter",
        }
    }

    /// Whether the record belongs to the "pending work" queue
    pub fn is_pending_work(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Pending | ProcessingStatus::Queued | ProcessingStatus::Failed
        )
    }

    /// Whether the record's value may feed an aggregate
    pub fn is_aggregatable(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Categorized
                | ProcessingStatus::Aggregated
                | ProcessingStatus::Completed
        )
    }

    /// Claimed by a batch that has not finished with it
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Processing
                | ProcessingStatus::Categorized
                | ProcessingStatus::Aggregated
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::DeadLetter)
    }

    /// Allowed lifecycle edges.
    ///
    /// Progress is monotonic; the only way back is `Failed -> Pending` (retry).
    /// Re-asserting the current state is always allowed.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (Pending, Queued) | (Queued, Pending) => true,
            (Pending | Queued, Processing | Categorized | Failed) => true,
            (Processing, Categorized | Aggregated | Completed | Failed) => true,
            (Categorized, Aggregated | Completed | Failed) => true,
            (Aggregated, Completed | Failed) => true,
            (Failed, Pending | DeadLetter) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clinical classification of an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClinicalStatus {
    Green,
    Amber,
    Red,
}

impl ClinicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClinicalStatus::Green => "green",
            ClinicalStatus::Amber => "amber",
            ClinicalStatus::Red => "red",
        }
    }

    /// Interpret a free-text flag supplied by a device or lab.
    ///
    /// Returns `None` when the text carries no status information.
    pub fn from_flag(flag: &str) -> Option<Self> {
        let flag = flag.trim().to_ascii_lowercase();
        match flag.as_str() {
            "normal" | "ok" | "green" | "within range" | "in range" | "negative" => {
                Some(ClinicalStatus::Green)
            }
            "high" | "low" | "elevated" | "borderline" | "amber" | "h" | "l" | "above range"
            | "below range" => Some(ClinicalStatus::Amber),
            "critical" | "abnormal" | "panic" | "red" | "critical high" | "critical low"
            | "hh" | "ll" => Some(ClinicalStatus::Red),
            _ => None,
        }
    }
}

impl fmt::Display for ClinicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
