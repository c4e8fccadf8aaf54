//! Summary counts over a reconciled set.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::EntityRecord;

pub const NO_VALUE_BUCKET: &str = "(none)";
pub const UNKNOWN_PERIOD_BUCKET: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    #[default]
    Year,
    Month,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodSource {
    /// Lifecycle activation date.
    Activation,
    /// A published date field such as `mandate_start`.
    Field(String),
}

impl Default for PeriodSource {
    fn default() -> Self {
        Self::Activation
    }
}

/// Count active records by the value of `field`. Blank values share one bucket.
pub fn count_active_by(records: &[EntityRecord], field: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records.iter().filter(|r| r.is_active()) {
        let bucket = record.field(field).unwrap_or(NO_VALUE_BUCKET).to_string();
        *counts.entry(bucket).or_default() += 1;
    }
    counts
}

/// Bucket every record's date (active or not) by year or month.
pub fn count_by_period(
    records: &[EntityRecord],
    source: &PeriodSource,
    period: Period,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        let stamp = match source {
            PeriodSource::Activation => record
                .lifecycle
                .and_then(|l| l.activated_on)
                .map(PeriodStamp::Day),
            PeriodSource::Field(name) => record.field(name).and_then(parse_period_stamp),
        };
        let bucket = stamp
            .and_then(|s| s.label(period))
            .unwrap_or_else(|| UNKNOWN_PERIOD_BUCKET.to_string());
        *counts.entry(bucket).or_default() += 1;
    }
    counts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodStamp {
    Day(NaiveDate),
    Year(i32),
}

impl PeriodStamp {
    fn label(self, period: Period) -> Option<String> {
        match (self, period) {
            (Self::Day(d), Period::Year) => Some(format!("{:04}", d.year())),
            (Self::Day(d), Period::Month) => Some(format!("{:04}-{:02}", d.year(), d.month())),
            (Self::Year(y), Period::Year) => Some(format!("{y:04}")),
            (Self::Year(_), Period::Month) => None,
        }
    }
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Full dates in common published formats, else the first standalone 4-digit year.
fn parse_period_stamp(value: &str) -> Option<PeriodStamp> {
    let value = value.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(PeriodStamp::Day(date));
        }
    }
    value
        .split(|c: char| !c.is_ascii_digit())
        .find(|run| run.len() == 4)
        .and_then(|run| run.parse().ok())
        .map(PeriodStamp::Year)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityKind, Lifecycle};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn legislator(bloc: &str, active: bool, mandate_start: &str) -> EntityRecord {
        EntityRecord::new(EntityKind::Legislator)
            .with_field("affiliation", bloc)
            .with_field("mandate_start", mandate_start)
            .with_lifecycle(Lifecycle {
                active,
                activated_on: Some(day("2024-06-01")),
                deactivated_on: None,
            })
    }

    #[test]
    fn category_counts_skip_inactive_records() {
        let records = vec![
            legislator("X", true, ""),
            legislator("X", true, ""),
            legislator("Y", false, ""),
            legislator("", true, ""),
        ];
        let counts = count_active_by(&records, "affiliation");
        assert_eq!(counts.get("X"), Some(&2));
        assert_eq!(counts.get("Y"), None);
        assert_eq!(counts.get(NO_VALUE_BUCKET), Some(&1));
    }

    #[test]
    fn period_counts_accept_published_date_shapes() {
        let records = vec![
            legislator("X", true, "10/12/2023"),
            legislator("X", false, "2021-12-10"),
            legislator("X", true, "Diciembre 2023"),
            legislator("X", true, "s/d"),
        ];
        let by_year = count_by_period(&records, &PeriodSource::Field("mandate_start".into()), Period::Year);
        assert_eq!(by_year.get("2023"), Some(&2));
        assert_eq!(by_year.get("2021"), Some(&1));
        assert_eq!(by_year.get(UNKNOWN_PERIOD_BUCKET), Some(&1));

        let by_month = count_by_period(&records, &PeriodSource::Field("mandate_start".into()), Period::Month);
        assert_eq!(by_month.get("2023-12"), Some(&1));
        assert_eq!(by_month.get(UNKNOWN_PERIOD_BUCKET), Some(&2));
    }

    #[test]
    fn activation_period_uses_lifecycle_dates() {
        let records = vec![legislator("X", true, ""), EntityRecord::new(EntityKind::Legislator)];
        let counts = count_by_period(&records, &PeriodSource::Activation, Period::Month);
        assert_eq!(counts.get("2024-06"), Some(&1));
        assert_eq!(counts.get(UNKNOWN_PERIOD_BUCKET), Some(&1));
    }
}
