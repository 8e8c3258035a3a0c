use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

static CLOCK_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?:[:.](\d{2}))?\s*([ap])?\.?\s*(?:m\.?)?$")
        .expect("clock time pattern is valid")
});

/// How an extracted value relates to the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchKind {
    /// Equal after trimming and lowercasing.
    Exact,
    /// Equal once punctuation and spacing are ignored.
    Normalized,
    Time,
    Numeric,
    /// One value contains the other.
    Partial,
    Mismatch,
    NotExtracted,
    NotOnPath,
}

impl MatchKind {
    pub fn is_full_match(self) -> bool {
        matches!(
            self,
            Self::Exact | Self::Normalized | Self::Time | Self::Numeric
        )
    }

    pub fn is_match(self) -> bool {
        self.is_full_match() || self == Self::Partial
    }
}

fn alphanumeric(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Minutes after midnight for values like `7pm`, `7:00 PM`, `19:00`.
/// A bare number is not a time.
fn clock_time(text: &str) -> Option<u32> {
    let captures = CLOCK_TIME.captures(text)?;
    let hour: u32 = captures[1].parse().ok()?;
    let minute: u32 = match captures.get(2) {
        Some(minute) => minute.as_str().parse().ok()?,
        None => 0,
    };
    if minute >= 60 {
        return None;
    }

    let hour = match captures.get(3).map(|meridiem| meridiem.as_str()) {
        Some(meridiem) if (1..=12).contains(&hour) => {
            (hour % 12) + if meridiem == "p" { 12 } else { 0 }
        }
        Some(_) => return None,
        None if captures.get(2).is_some() && hour < 24 => hour,
        None => return None,
    };

    Some(hour * 60 + minute)
}

fn number(text: &str) -> Option<f64> {
    text.trim_start_matches('$')
        .replace(',', "")
        .parse()
        .ok()
        .filter(|value: &f64| value.is_finite())
}

/// Format-tolerant comparison of an expected goal value with what the
/// pathway extracted.
pub fn compare(expected: &str, actual: &str) -> MatchKind {
    let expected = expected.trim().to_lowercase();
    let actual = actual.trim().to_lowercase();

    if expected == actual {
        return MatchKind::Exact;
    }
    if expected.is_empty() || actual.is_empty() {
        return MatchKind::Mismatch;
    }

    let (expected_chars, actual_chars) = (alphanumeric(&expected), alphanumeric(&actual));
    if !expected_chars.is_empty() && expected_chars == actual_chars {
        return MatchKind::Normalized;
    }

    if let (Some(expected), Some(actual)) = (clock_time(&expected), clock_time(&actual)) {
        return if expected == actual {
            MatchKind::Time
        } else {
            MatchKind::Mismatch
        };
    }

    if let (Some(expected), Some(actual)) = (number(&expected), number(&actual)) {
        if expected == actual {
            return MatchKind::Numeric;
        }
    }

    if expected.contains(&actual) || actual.contains(&expected) {
        return MatchKind::Partial;
    }

    MatchKind::Mismatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exact_ignores_case_and_padding() {
        assert_eq!(compare("Ada Lovelace", "  ada lovelace "), MatchKind::Exact);
    }

    #[test]
    fn normalized_ignores_punctuation() {
        assert_eq!(compare("(555) 123-4567", "555 123 4567"), MatchKind::Normalized);
        assert_eq!(compare("ada@example.com", "ada@example.com."), MatchKind::Normalized);
    }

    #[test]
    fn clock_times_in_different_formats_match() {
        assert_eq!(compare("7pm", "7:00 PM"), MatchKind::Time);
        assert_eq!(compare("7:30 p.m.", "19:30"), MatchKind::Time);
        assert_eq!(compare("12am", "00:00"), MatchKind::Time);
        assert_eq!(compare("7pm", "7:00 AM"), MatchKind::Mismatch);
    }

    #[test]
    fn bare_numbers_are_not_times() {
        assert_eq!(clock_time("7"), None);
        assert_eq!(clock_time("25:00"), None);
        assert_eq!(clock_time("13pm"), None);
        assert_eq!(clock_time("9:15"), Some(555));
    }

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(compare("4", "4.0"), MatchKind::Numeric);
        assert_eq!(compare("$1,200", "1200.00"), MatchKind::Numeric);
    }

    #[test]
    fn containment_is_partial() {
        assert_eq!(compare("Ada", "Ada Lovelace"), MatchKind::Partial);
        assert!(MatchKind::Partial.is_match());
        assert!(!MatchKind::Partial.is_full_match());
    }

    #[test]
    fn empty_actual_never_matches() {
        assert_eq!(compare("Ada", ""), MatchKind::Mismatch);
        assert_eq!(compare("Ada", "Grace"), MatchKind::Mismatch);
    }
}
