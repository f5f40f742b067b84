//! Engine configuration
//!
//! Loaded from JSON (every field optional, missing fields take defaults) and
//! overridable with `ROLLUP_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::aggregate::AggregationSettings;
use crate::error::RollupError;
use crate::overlap::SleepBounds;
use crate::status::ClinicalStatus;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Raw rows claimed per batch
    pub batch_size: usize,
    /// Failed attempts before a record is dead-lettered
    pub max_retries: u32,
    /// Background worker tasks
    pub workers: usize,
    /// Capacity of the trigger channel
    pub trigger_queue_capacity: usize,
    pub inference_timeout_ms: u64,
    pub mapping_cache_capacity: usize,
    /// Status when no contributing row carries status information
    pub default_status: ClinicalStatus,
    pub sleep_min_hours: f64,
    pub sleep_max_hours: f64,
    /// Upper bound, in chars, of categorical strings
    pub max_categorical_len: usize,
    /// Age after which an in-flight record is presumed abandoned by a dead worker
    pub stale_claim_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            max_retries: 3,
            workers: 4,
            trigger_queue_capacity: 1024,
            inference_timeout_ms: 2000,
            mapping_cache_capacity: 1024,
            default_status: ClinicalStatus::Amber,
            sleep_min_hours: 0.1,
            sleep_max_hours: 16.0,
            max_categorical_len: 255,
            stale_claim_secs: 600,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, RollupError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RollupError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RollupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Apply `ROLLUP_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), RollupError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), RollupError> {
        if let Some(v) = parse_var(&lookup, "ROLLUP_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "ROLLUP_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "ROLLUP_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = parse_var(&lookup, "ROLLUP_TRIGGER_QUEUE_CAPACITY")? {
            self.trigger_queue_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "ROLLUP_INFERENCE_TIMEOUT_MS")? {
            self.inference_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ROLLUP_MAPPING_CACHE_CAPACITY")? {
            self.mapping_cache_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "ROLLUP_STALE_CLAIM_SECS")? {
            self.stale_claim_secs = v;
        }
        if let Some(raw) = lookup("ROLLUP_DEFAULT_STATUS") {
            self.default_status = ClinicalStatus::from_flag(&raw).ok_or_else(|| {
                RollupError::Config(format!("ROLLUP_DEFAULT_STATUS: unknown status '{}'", raw))
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), RollupError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("workers", self.workers),
            ("trigger_queue_capacity", self.trigger_queue_capacity),
            ("mapping_cache_capacity", self.mapping_cache_capacity),
            ("max_categorical_len", self.max_categorical_len),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(RollupError::Config(format!("{} must be positive", name)));
        }
        if self.stale_claim_secs == 0 {
            return Err(RollupError::Config("stale_claim_secs must be positive".to_string()));
        }
        if self.max_retries == 0 {
            return Err(RollupError::Config("max_retries must be positive".to_string()));
        }
        if !(self.sleep_min_hours >= 0.0 && self.sleep_min_hours < self.sleep_max_hours) {
            return Err(RollupError::Config(format!(
                "invalid sleep bounds {}..{}",
                self.sleep_min_hours, self.sleep_max_hours
            )));
        }
        Ok(())
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn stale_claim_age(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn aggregation_settings(&self) -> AggregationSettings {
        AggregationSettings {
            default_status: self.default_status,
            max_text_len: self.max_categorical_len,
            sleep_bounds: SleepBounds {
                min_hours: self.sleep_min_hours,
                max_hours: self.sleep_max_hours,
            },
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, RollupError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RollupError::Config(format!("{}: cannot parse '{}'", key, raw))),
    }
}
