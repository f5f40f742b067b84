//! Unit normalization
//!
//! This module expresses measured values in the canonical unit of their metric.
//! - Durations normalized to hours (sleep) or minutes (activity)
//! - Temperatures to celsius, masses to kilograms, distances to meters
//! - Unrecognized units pass through untouched so inconsistencies stay visible

use serde::{Deserialize, Serialize};

/// Family of units a metric is measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitFamily {
    /// Sleep and other long spans, canonical unit: hours
    DurationHours,
    /// Workout / exercise time, canonical unit: minutes
    DurationMinutes,
    Temperature,
    Mass,
    Distance,
    Energy,
    Glucose,
    /// No conversion table; values keep their submitted unit
    Opaque,
}

impl UnitFamily {
    /// Pick the conversion table for a metric name
    pub fn for_metric(metric_type: &str) -> Self {
        let name = metric_type.to_ascii_lowercase();

        let sleep_span = name.contains("sleep")
            && !["score", "efficiency", "rate", "heart"]
                .iter()
                .any(|k| name.contains(k));

        if sleep_span {
            UnitFamily::DurationHours
        } else if name.contains("duration")
            || name.contains("exercise time")
            || name.contains("active minutes")
            || name.contains("exercise minutes")
            || name.contains("mindful")
        {
            UnitFamily::DurationMinutes
        } else if name.contains("temperature") || name.contains("temp") {
            UnitFamily::Temperature
        } else if name.contains("weight") || name.contains("body mass") || name.contains("lean mass")
        {
            UnitFamily::Mass
        } else if name.contains("distance") {
            UnitFamily::Distance
        } else if name.contains("energy") || name.contains("calorie") {
            UnitFamily::Energy
        } else if name.contains("glucose") {
            UnitFamily::Glucose
        } else {
            UnitFamily::Opaque
        }
    }

    /// Canonical unit label, `None` for opaque metrics
    pub fn canonical_unit(&self) -> Option<&'static str> {
        match self {
            UnitFamily::DurationHours => Some("hours"),
            UnitFamily::DurationMinutes => Some("min"),
            UnitFamily::Temperature => Some("degC"),
            UnitFamily::Mass => Some("kg"),
            UnitFamily::Distance => Some("m"),
            UnitFamily::Energy => Some("kcal"),
            UnitFamily::Glucose => Some("mg/dL"),
            UnitFamily::Opaque => None,
        }
    }
}

/// A value expressed in its metric's canonical unit (when the unit was known)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedValue {
    pub value: f64,
    pub unit: String,
    /// False when the submitted unit was not recognized and passed through
    pub recognized: bool,
}

/// Normalizer for converting measured values to canonical units
pub struct UnitNormalizer;

impl UnitNormalizer {
    /// Normalize `value` measured in `unit` for `metric_type`
    pub fn normalize(value: f64, unit: &str, metric_type: &str) -> NormalizedValue {
        Self::normalize_in(UnitFamily::for_metric(metric_type), value, unit)
    }

    /// Normalize against an explicit family
    pub fn normalize_in(family: UnitFamily, value: f64, unit: &str) -> NormalizedValue {
        let converted = match family {
            UnitFamily::DurationHours => duration_seconds(unit).map(|s| value * s / 3600.0),
            UnitFamily::DurationMinutes => duration_seconds(unit).map(|s| value * s / 60.0),
            UnitFamily::Temperature => to_celsius(value, unit),
            UnitFamily::Mass => mass_kg(unit).map(|f| value * f),
            UnitFamily::Distance => distance_m(unit).map(|f| value * f),
            UnitFamily::Energy => energy_kcal(unit).map(|f| value * f),
            UnitFamily::Glucose => glucose_mg_dl(unit).map(|f| value * f),
            UnitFamily::Opaque => None,
        };

        match (converted, family.canonical_unit()) {
            (Some(v), Some(canonical)) => NormalizedValue {
                value: v,
                unit: canonical.to_string(),
                recognized: true,
            },
            _ => NormalizedValue {
                value,
                unit: unit.trim().to_string(),
                recognized: family == UnitFamily::Opaque,
            },
        }
    }
}

fn unit_key(unit: &str) -> String {
    unit.trim().to_ascii_lowercase().replace(['°', ' '], "")
}

/// Seconds per unit
fn duration_seconds(unit: &str) -> Option<f64> {
    match unit_key(unit).as_str() {
        "ms" | "msec" | "millisecond" | "milliseconds" => Some(0.001),
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1.0),
        "min" | "mins" | "minute" | "minutes" => Some(60.0),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(3600.0),
        _ => None,
    }
}

fn to_celsius(value: f64, unit: &str) -> Option<f64> {
    match unit_key(unit).as_str() {
        "c" | "degc" | "celsius" | "cel" => Some(value),
        "f" | "degf" | "fahrenheit" | "[degf]" => Some((value - 32.0) * 5.0 / 9.0),
        "k" | "kelvin" => Some(value - 273.15),
        _ => None,
    }
}

/// Kilograms per unit
fn mass_kg(unit: &str) -> Option<f64> {
    match unit_key(unit).as_str() {
        "kg" | "kgs" | "kilogram" | "kilograms" => Some(1.0),
        "g" | "gram" | "grams" => Some(0.001),
        "lb" | "lbs" | "pound" | "pounds" | "[lb_av]" => Some(0.453_592_37),
        _ => None,
    }
}

/// Meters per unit
fn distance_m(unit: &str) -> Option<f64> {
    match unit_key(unit).as_str() {
        "m" | "meter" | "meters" | "metre" | "metres" => Some(1.0),
        "km" | "kilometer" | "kilometers" => Some(1000.0),
        "mi" | "mile" | "miles" => Some(1609.344),
        "ft" | "foot" | "feet" => Some(0.3048),
        _ => None,
    }
}

/// Kilocalories per unit
fn energy_kcal(unit: &str) -> Option<f64> {
    match unit_key(unit).as_str() {
        "kcal" | "cal" | "calories" | "kilocalories" => Some(1.0),
        "kj" | "kilojoule" | "kilojoules" => Some(1.0 / 4.184),
        _ => None,
    }
}

/// mg/dL per unit (glucose only)
fn glucose_mg_dl(unit: &str) -> Option<f64> {
    match unit_key(unit).as_str() {
        "mg/dl" => Some(1.0),
        "mmol/l" => Some(18.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_duration_to_hours() {
        let n = UnitNormalizer::normalize(90.0, "minutes", "sleep_duration");
        assert!((n.value - 1.5).abs() < 1e-9);
        assert_eq!(n.unit, "hours");

        let n = UnitNormalizer::normalize(5400.0, "s", "Sleep Analysis");
        assert!((n.value - 1.5).abs() < 1e-9);

        let n = UnitNormalizer::normalize(7.0, "hr", "sleep");
        assert_eq!(n.value, 7.0);
        assert!(n.recognized);
    }

    #[test]
    fn test_other_families() {
        let n = UnitNormalizer::normalize(98.6, "°F", "Body Temperature");
        assert!((n.value - 37.0).abs() < 1e-9);
        assert_eq!(n.unit, "degC");

        let n = UnitNormalizer::normalize(2.0, "km", "walking_distance");
        assert_eq!(n.value, 2000.0);

        let n = UnitNormalizer::normalize(5.5, "mmol/L", "Blood Glucose");
        assert!((n.value - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrecognized_unit_passes_through() {
        let n = UnitNormalizer::normalize(3.0, "fortnights", "sleep_duration");
        assert_eq!(n.value, 3.0);
        assert_eq!(n.unit, "fortnights");
        assert!(!n.recognized);
    }

    #[test]
    fn test_opaque_metric_keeps_unit() {
        let n = UnitNormalizer::normalize(72.0, "bpm", "heart_rate");
        assert_eq!(n.value, 72.0);
        assert_eq!(n.unit, "bpm");
        assert!(n.recognized);
    }

    #[test]
    fn test_sleep_score_is_not_a_duration() {
        assert_eq!(UnitFamily::for_metric("sleep_score"), UnitFamily::Opaque);
    }
}
