//! Lab reference range parsing
//!
//! Lab results carry free-text normal ranges such as `"7-56 U/L"`, `">60"` or
//! `"<5.7 %"`. Unparseable text yields an empty range, never an error.

use serde::{Deserialize, Serialize};

use crate::coerce::{coerce, Coerced};
use crate::status::ClinicalStatus;

/// Parsed normal reference range; either bound may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ReferenceRange {
    pub fn parse(text: &str) -> Self {
        let s = text.trim();

        if let Some(rest) = strip_any(s, &[">=", "≥", ">"]) {
            return ReferenceRange {
                min: number(rest),
                max: None,
            };
        }
        if let Some(rest) = strip_any(s, &["<=", "≤", "<"]) {
            return ReferenceRange {
                min: None,
                max: number(rest),
            };
        }

        let Some((low, high)) = split_range(s) else {
            return ReferenceRange::default();
        };

        match (number(low), number(high)) {
            (Some(min), Some(max)) if min <= max => ReferenceRange {
                min: Some(min),
                max: Some(max),
            },
            _ => ReferenceRange::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Green inside the range, amber outside, `None` without bounds
    pub fn classify(&self, value: f64) -> Option<ClinicalStatus> {
        if self.is_empty() {
            return None;
        }
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above {
            Some(ClinicalStatus::Amber)
        } else {
            Some(ClinicalStatus::Green)
        }
    }
}

fn strip_any<'a>(s: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| s.strip_prefix(p))
}

fn number(s: &str) -> Option<f64> {
    match coerce(s) {
        Coerced::Numeric(v) => Some(v),
        Coerced::NonNumeric(_) => None,
    }
}

/// Split "A-B", "A – B" or "A to B" at the separator following the first digit
fn split_range(s: &str) -> Option<(&str, &str)> {
    let first_digit = s.find(|c: char| c.is_ascii_digit())?;
    let tail = &s[first_digit..];

    let candidates = [
        tail.find(" to ").map(|i| (i, " to ".len())),
        tail.find('–').map(|i| (i, '–'.len_utf8())),
        tail.find('-').map(|i| (i, 1)),
    ];
    let (idx, sep_len) = candidates.into_iter().flatten().min_by_key(|(i, _)| *i)?;

    let split = first_digit + idx;
    Some((&s[..split], &s[split + sep_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        let r = ReferenceRange::parse("7-56 U/L");
        assert_eq!(r.min, Some(7.0));
        assert_eq!(r.max, Some(56.0));

        let r = ReferenceRange::parse("3.5 – 5.0");
        assert_eq!((r.min, r.max), (Some(3.5), Some(5.0)));

        let r = ReferenceRange::parse("70 to 99 mg/dL");
        assert_eq!((r.min, r.max), (Some(70.0), Some(99.0)));
    }

    #[test]
    fn test_parse_open_bounds() {
        let r = ReferenceRange::parse(">60");
        assert_eq!((r.min, r.max), (Some(60.0), None));

        let r = ReferenceRange::parse("<5.7 %");
        assert_eq!((r.min, r.max), (None, Some(5.7)));

        let r = ReferenceRange::parse(">= 40");
        assert_eq!((r.min, r.max), (Some(40.0), None));
    }

    #[test]
    fn test_unparseable_is_empty() {
        assert!(ReferenceRange::parse("see report").is_empty());
        assert!(ReferenceRange::parse("").is_empty());
        assert!(ReferenceRange::parse("56-7").is_empty());
        assert!(ReferenceRange::parse("<").is_empty());
    }

    #[test]
    fn test_classify() {
        let r = ReferenceRange::parse("7-56");
        assert_eq!(r.classify(45.0), Some(ClinicalStatus::Green));
        assert_eq!(r.classify(80.0), Some(ClinicalStatus::Amber));
        assert_eq!(ReferenceRange::parse(">60").classify(59.0), Some(ClinicalStatus::Amber));
        assert_eq!(ReferenceRange::default().classify(1.0), None);
    }
}
