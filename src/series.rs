//! Series definitions, partition periods and partition keys.

use crate::encoding::{Codec, NumberType};
use crate::{Result, TslabError};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The span of time covered by one partition file.
///
/// Every period has a canonical label (the formatted period start) that doubles as the
/// partition file name. `format` and `parse` are exact inverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Period {
    Day,
    Month,
    Year,
}

impl Period {
    pub fn name(self) -> &'static str {
        match self {
            Period::Day => "DAY",
            Period::Month => "MONTH",
            Period::Year => "YEAR",
        }
    }

    /// chrono format string of the label.
    pub fn label_format(self) -> &'static str {
        match self {
            Period::Day => "%Y%m%d",
            Period::Month => "%Y%m",
            Period::Year => "%Y",
        }
    }

    fn label_len(self) -> usize {
        match self {
            Period::Day => 8,
            Period::Month => 6,
            Period::Year => 4,
        }
    }

    fn first_day(self, date: NaiveDate) -> NaiveDate {
        match self {
            Period::Day => date,
            Period::Month => date.with_day(1).unwrap_or(date),
            Period::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }

    /// Start of the period containing `timestamp`.
    pub fn start_of(self, timestamp: i64) -> Result<i64> {
        let date = to_datetime(timestamp)?.date_naive();
        Ok(midnight_millis(self.first_day(date)))
    }

    /// Start of the period following the one starting at `start`.
    pub fn end_of(self, start: i64) -> Result<i64> {
        let date = to_datetime(start)?.date_naive();
        let next = match self {
            Period::Day => date.succ_opt(),
            Period::Month => date.checked_add_months(Months::new(1)),
            Period::Year => date.checked_add_months(Months::new(12)),
        };
        next.map(midnight_millis)
            .ok_or(TslabError::InvalidTimestamp(start))
    }

    /// Length of the period starting at `start`, in milliseconds.
    pub fn duration_at(self, start: i64) -> Result<i64> {
        Ok(self.end_of(start)? - start)
    }

    /// Label of the period containing `timestamp`.
    pub fn format(self, timestamp: i64) -> Result<String> {
        let date = self.first_day(to_datetime(timestamp)?.date_naive());
        Ok(date.format(self.label_format()).to_string())
    }

    /// Start timestamp of the period named by `label`.
    pub fn parse(self, label: &str) -> Result<i64> {
        let invalid = || TslabError::InvalidLabel {
            label: label.to_string(),
            period: self.name().to_string(),
        };

        if label.len() != self.label_len() || !label.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let padded = match self {
            Period::Day => label.to_string(),
            Period::Month => format!("{label}01"),
            Period::Year => format!("{label}0101"),
        };
        let date = NaiveDate::parse_from_str(&padded, "%Y%m%d").map_err(|_| invalid())?;
        let start = midnight_millis(date);

        if self.format(start)? != label {
            return Err(invalid());
        }
        Ok(start)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Period {
    type Err = TslabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAY" => Ok(Period::Day),
            "MONTH" => Ok(Period::Month),
            "YEAR" => Ok(Period::Year),
            _ => Err(TslabError::UnknownPeriod(s.to_string())),
        }
    }
}

fn to_datetime(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp).ok_or(TslabError::InvalidTimestamp(timestamp))
}

fn midnight_millis(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .timestamp_millis()
}

/// Static description of a series: how its values are stored and partitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesDefinition {
    pub id: String,
    pub number_type: NumberType,
    /// Slot interval in milliseconds.
    pub interval: i64,
    pub period: Period,
    /// Lower bound of the declared domain, required by mapped and curved types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound of the declared domain, required by mapped and curved types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl SeriesDefinition {
    pub fn new(
        id: impl Into<String>,
        number_type: NumberType,
        interval: i64,
        period: Period,
    ) -> Self {
        Self {
            id: id.into(),
            number_type,
            interval,
            period,
            min: None,
            max: None,
        }
    }

    /// Declares the `[min, max]` domain.
    pub fn with_domain(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Resolves the codec chain for this series.
    pub fn codec(&self) -> Result<Arc<dyn Codec>> {
        self.number_type.codec(self.min, self.max)
    }

    /// Checks that the definition can address and encode partitions.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty()
            || self.id.starts_with('.')
            || self.id.contains(['/', '\\', '\0'])
        {
            return Err(TslabError::InvalidConfiguration(format!(
                "invalid series id '{}'",
                self.id
            )));
        }
        if self.interval <= 0 {
            return Err(TslabError::InvalidConfiguration(format!(
                "series '{}' has non-positive interval {}",
                self.id, self.interval
            )));
        }
        // A day is the shortest period: it must hold at least one slot.
        if self.period == Period::Day && self.interval > 86_400_000 {
            return Err(TslabError::InvalidConfiguration(format!(
                "series '{}' interval {}ms is longer than its period",
                self.id, self.interval
            )));
        }
        self.codec()?;
        Ok(())
    }
}

/// A series definition with its free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesFile {
    pub definition: SeriesDefinition,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SeriesFile {
    pub fn new(definition: SeriesDefinition) -> Self {
        Self {
            definition,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

/// Address of one partition: the series and the label of its period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub series_id: String,
    pub label: String,
}

impl PartitionKey {
    pub fn new(series_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            series_id: series_id.into(),
            label: label.into(),
        }
    }

    /// Key of the partition of `series_id` covering `timestamp`.
    pub fn of(series_id: &str, period: Period, timestamp: i64) -> Result<Self> {
        Ok(Self::new(series_id, period.format(timestamp)?))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.series_id, self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-11-11T13:45:00Z
    const TS: i64 = 1_731_332_700_000;

    #[test]
    fn test_labels_round_trip() {
        assert_eq!(Period::Day.format(TS).unwrap(), "20241111");
        assert_eq!(Period::Month.format(TS).unwrap(), "202411");
        assert_eq!(Period::Year.format(TS).unwrap(), "2024");

        for period in [Period::Day, Period::Month, Period::Year] {
            let label = period.format(TS).unwrap();
            let start = period.parse(&label).unwrap();
            assert_eq!(start, period.start_of(TS).unwrap());
            assert_eq!(period.format(start).unwrap(), label);
        }
    }

    #[test]
    fn test_period_bounds() {
        let day = Period::Day.start_of(TS).unwrap();
        assert_eq!(day, 1_731_283_200_000);
        assert_eq!(Period::Day.duration_at(day).unwrap(), 86_400_000);

        let november = Period::Month.parse("202411").unwrap();
        assert_eq!(Period::Month.duration_at(november).unwrap(), 30 * 86_400_000);
        let february = Period::Month.parse("202402").unwrap();
        assert_eq!(Period::Month.duration_at(february).unwrap(), 29 * 86_400_000);

        let year = Period::Year.parse("2023").unwrap();
        assert_eq!(Period::Year.duration_at(year).unwrap(), 365 * 86_400_000);
    }

    #[test]
    fn test_rejects_non_canonical_labels() {
        for (period, label) in [
            (Period::Day, "2024111"),
            (Period::Day, "20241131"),
            (Period::Day, "2024-11-1"),
            (Period::Month, "202413"),
            (Period::Month, "20241"),
            (Period::Year, "24"),
            (Period::Year, "+202"),
        ] {
            assert!(
                matches!(period.parse(label), Err(TslabError::InvalidLabel { .. })),
                "{period} accepted {label}"
            );
        }
    }

    #[test]
    fn test_partition_key_of() {
        let key = PartitionKey::of("temp", Period::Day, TS).unwrap();
        assert_eq!(key, PartitionKey::new("temp", "20241111"));
        assert_eq!(key.to_string(), "temp/20241111");
    }

    #[test]
    fn test_definition_validation() {
        let ok = SeriesDefinition::new("cpu", NumberType::Float32, 60_000, Period::Day);
        assert!(ok.validate().is_ok());

        let bad_id = SeriesDefinition::new("../etc", NumberType::Float32, 60_000, Period::Day);
        assert!(bad_id.validate().is_err());

        let bad_interval = SeriesDefinition::new("cpu", NumberType::Float32, 0, Period::Day);
        assert!(bad_interval.validate().is_err());

        let missing_domain = SeriesDefinition::new("cpu", NumberType::Mapped8, 1000, Period::Day);
        assert!(matches!(
            missing_domain.validate(),
            Err(TslabError::MissingDomain { .. })
        ));
        assert!(missing_domain.with_domain(0.0, 1.0).validate().is_ok());
    }

    #[test]
    fn test_series_file_json() {
        let file = SeriesFile::new(
            SeriesDefinition::new("hum", NumberType::Curved16, 1000, Period::Month)
                .with_domain(0.0, 100.0),
        )
        .with_metadata("site", "north");
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"curved16\""));
        assert!(json.contains("\"MONTH\""));
        let parsed: SeriesFile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, file);
    }
}
