//! Numeric coercion of raw measurement values
//!
//! Raw values arrive as text ("72", "7.5 mmol/L", "High", "1,200"). Every
//! aggregator goes through [`coerce`] so that numeric-versus-categorical
//! handling is decided in exactly one place.

use serde::{Deserialize, Serialize};

/// Largest magnitude accepted from a number scanned out of surrounding text
pub const SCAN_MAGNITUDE_CEILING: f64 = 1e15;

/// Result of coercing a raw value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Coerced {
    Numeric(f64),
    /// Original text, untouched
    NonNumeric(String),
}

impl Coerced {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Coerced::Numeric(v) => Some(*v),
            Coerced::NonNumeric(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Coerced::Numeric(_))
    }

    /// Text used when the value takes part in a categorical aggregate
    pub fn display_text(&self) -> String {
        match self {
            Coerced::Numeric(v) => format_number(*v),
            Coerced::NonNumeric(s) => s.trim().to_string(),
        }
    }
}

/// Coerce raw text into a number. Total over every input; never panics.
pub fn coerce(raw: &str) -> Coerced {
    let trimmed = raw.trim();

    if let Some(v) = parse_finite(trimmed) {
        return Coerced::Numeric(v);
    }

    if let Some(v) = strip_digit_grouping(trimmed).and_then(|s| parse_finite(&s)) {
        return Coerced::Numeric(v);
    }

    if let Some(v) = scan_first_number(trimmed) {
        if v.abs() < SCAN_MAGNITUDE_CEILING {
            return Coerced::Numeric(v);
        }
    }

    let stripped: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if let Some(v) = parse_finite(&stripped) {
        return Coerced::Numeric(v);
    }

    Coerced::NonNumeric(raw.to_string())
}

/// Render a number the way it is stored in categorical aggregates
pub fn format_number(v: f64) -> String {
    format!("{}", v)
}

fn parse_finite(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// "1,200,500" -> "1200500"; anything else that is not cleanly grouped -> None
fn strip_digit_grouping(s: &str) -> Option<String> {
    if !s.contains(',') {
        return None;
    }
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let unsigned = int_part.strip_prefix('-').unwrap_or(int_part);
    let mut groups = unsigned.split(',');
    let head = groups.next()?;
    if head.is_empty() || head.len() > 3 || !head.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    for group in groups {
        if group.len() != 3 || !group.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    let mut out = int_part.replace(',', "");
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    Some(out)
}

/// Find the first well-formed floating-point literal inside `s`:
/// optional sign, digits, optional fraction, optional exponent.
fn scan_first_number(s: &str) -> Option<f64> {
    let bytes = s.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if let Some(end) = match_number(bytes, i) {
            return s.get(i..end).and_then(parse_finite);
        }
        i += 1;
    }

    None
}

/// Length-maximal number literal starting at `start`, returning its end index
fn match_number(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }

    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut digits = i - int_start;

    if i < bytes.len() && bytes[i] == b'.' {
        let frac_start = i + 1;
        let mut j = frac_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if digits > 0 || j > frac_start {
            digits += j - frac_start;
            i = j;
        }
    }

    if digits == 0 {
        return None;
    }

    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }

    Some(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(coerce("72"), Coerced::Numeric(72.0));
        assert_eq!(coerce(" -3.5 "), Coerced::Numeric(-3.5));
        assert_eq!(coerce("1.2e3"), Coerced::Numeric(1200.0));
    }

    #[test]
    fn test_number_embedded_in_text() {
        assert_eq!(coerce("7.5 mmol/L"), Coerced::Numeric(7.5));
        assert_eq!(coerce("HR: 64bpm"), Coerced::Numeric(64.0));
        assert_eq!(coerce("120/80"), Coerced::Numeric(120.0));
        assert_eq!(coerce("approx .5"), Coerced::Numeric(0.5));
    }

    #[test]
    fn test_digit_grouping() {
        assert_eq!(coerce("1,200"), Coerced::Numeric(1200.0));
        assert_eq!(coerce("12,345.5"), Coerced::Numeric(12345.5));
    }

    #[test]
    fn test_non_numeric_preserves_original_text() {
        assert_eq!(coerce("High"), Coerced::NonNumeric("High".to_string()));
        assert_eq!(coerce(""), Coerced::NonNumeric(String::new()));
        assert_eq!(coerce(" Positive "), Coerced::NonNumeric(" Positive ".to_string()));
    }

    #[test]
    fn test_non_finite_is_not_numeric() {
        assert!(!coerce("NaN").is_numeric());
        assert!(!coerce("inf").is_numeric());
    }

    #[test]
    fn test_scan_ceiling() {
        // Scanned magnitude over the ceiling is rejected, the strip retry still
        // parses the bare digits.
        assert_eq!(coerce("id 9999999999999999"), Coerced::Numeric(9999999999999999.0));
        assert!(!coerce("--").is_numeric());
    }

    #[test]
    fn test_total_over_odd_input() {
        for raw in ["\u{1F600}", "e5", "-", ".", "+-1", "1e", "..1..", "µg 3"] {
            let _ = coerce(raw);
        }
        assert_eq!(coerce("1e"), Coerced::Numeric(1.0));
        assert_eq!(coerce("µg 3"), Coerced::Numeric(3.0));
    }

    #[test]
    fn test_display_text() {
        assert_eq!(coerce("45").display_text(), "45");
        assert_eq!(coerce("45.50").display_text(), "45.5");
        assert_eq!(coerce(" High ").display_text(), "High");
    }
}
