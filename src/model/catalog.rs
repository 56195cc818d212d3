//! Read-only shape of the shared biomarker catalog.
//!
//! Entries are fetched from the catalog search service and never mutated by
//! this crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Reference interval for one unit. Open-ended bounds ("< 200", "> 40")
/// leave the missing side as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceInterval {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

/// Health-status label derived from a reference interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStatus {
    Low,
    Normal,
    High,
}

impl RangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ReferenceInterval {
    /// Classify a value against this interval. Bounds are inclusive on the
    /// normal side: a value exactly at `high` (or `low`) is normal.
    pub fn status_of(&self, value: f64) -> RangeStatus {
        if let Some(low) = self.low {
            if value < low {
                return RangeStatus::Low;
            }
        }
        if let Some(high) = self.high {
            if value > high {
                return RangeStatus::High;
            }
        }
        RangeStatus::Normal
    }
}

/// One canonical catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub long_name: String,
    pub short_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Units this biomarker is validly reported in.
    #[serde(default)]
    pub units: Vec<String>,
    /// Reference intervals keyed by unit string.
    #[serde(default)]
    pub reference_ranges: HashMap<String, ReferenceInterval>,
}

impl CatalogEntry {
    pub fn interval_for(&self, unit: &str) -> Option<&ReferenceInterval> {
        self.reference_ranges.get(unit)
    }

    /// Every name this entry answers to: long, short, and aliases.
    pub fn all_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![self.long_name.as_str()];
        if let Some(short) = &self.short_name {
            names.push(short);
        }
        names.extend(self.aliases.iter().map(String::as_str));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(low: f64, high: f64) -> ReferenceInterval {
        ReferenceInterval {
            low: Some(low),
            high: Some(high),
        }
    }

    #[test]
    fn value_above_high_is_high() {
        assert_eq!(interval(0.0, 200.0).status_of(250.0), RangeStatus::High);
    }

    #[test]
    fn boundary_value_is_normal() {
        // Inclusive upper bound: exactly 200 with high=200 is normal.
        assert_eq!(interval(0.0, 200.0).status_of(200.0), RangeStatus::Normal);
        assert_eq!(interval(3.5, 5.0).status_of(3.5), RangeStatus::Normal);
    }

    #[test]
    fn value_below_low_is_low() {
        assert_eq!(interval(3.5, 5.0).status_of(3.1), RangeStatus::Low);
    }

    #[test]
    fn open_ended_interval_only_checks_defined_bound() {
        let upper_only = ReferenceInterval {
            low: None,
            high: Some(200.0),
        };
        assert_eq!(upper_only.status_of(0.0), RangeStatus::Normal);
        assert_eq!(upper_only.status_of(201.0), RangeStatus::High);

        let lower_only = ReferenceInterval {
            low: Some(40.0),
            high: None,
        };
        assert_eq!(lower_only.status_of(39.0), RangeStatus::Low);
        assert_eq!(lower_only.status_of(9999.0), RangeStatus::Normal);
    }

    #[test]
    fn interval_lookup_is_per_unit() {
        let mut ranges = HashMap::new();
        ranges.insert("mg/dL".to_string(), interval(0.0, 200.0));
        let entry = CatalogEntry {
            id: "chol-total".into(),
            long_name: "Total Cholesterol".into(),
            short_name: Some("CHOL".into()),
            aliases: vec![],
            units: vec!["mg/dL".into()],
            reference_ranges: ranges,
        };
        assert!(entry.interval_for("mg/dL").is_some());
        assert!(entry.interval_for("mmol/L").is_none());
    }
}
