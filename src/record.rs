//! Samples as they are recorded, and the timestamp format shared by the
//! recorder and the sync agent.

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::reader::Sample;

/// Decimal places kept for recorded values.
const ROUND_DIGITS: i32 = 3;

/// One row per tick per running channel. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub line: String,
    pub shift: String,
    pub work_order: String,
    pub time: String,
    pub temperature: f64,
    pub current: f64,
}

/// The JSON document stored in the `data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub line: String,
    pub shift: String,
    pub work_order: String,
    pub temperature: f64,
    pub current: f64,
}

impl Record {
    /// Build a record from the latest sample; missing values become `0.0`.
    pub fn from_sample(
        line: &str,
        shift: &str,
        work_order: &str,
        sample: Sample,
        at: DateTime<Local>,
    ) -> Self {
        Self {
            line: line.to_string(),
            shift: shift.to_string(),
            work_order: work_order.to_string(),
            time: format_timestamp(at),
            temperature: round(sample.temperature.unwrap_or(0.0)),
            current: round(sample.current.unwrap_or(0.0)),
        }
    }

    pub fn payload(&self) -> RecordPayload {
        RecordPayload {
            line: self.line.clone(),
            shift: self.shift.clone(),
            work_order: self.work_order.clone(),
            temperature: self.temperature,
            current: self.current,
        }
    }
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(ROUND_DIGITS);
    (value * scale).round() / scale
}

/// RFC 3339 in UTC with millisecond precision and a `Z` suffix.
///
/// Every timestamp written to the store or the sync state uses this one
/// fixed-width format so text comparison orders them chronologically, also
/// across a change of the local UTC offset.
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rewrite any RFC 3339 timestamp into the stored UTC form.
///
/// Returns `None` when `timestamp` does not parse.
pub fn normalize_timestamp(timestamp: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn now_timestamp() -> String {
    format_timestamp(Local::now())
}

/// Local calendar date a stored timestamp belongs to.
pub fn partition_date(timestamp: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|dt| dt.with_timezone(&Local).date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn absent_values_default_to_zero() {
        let at = Local.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let record = Record::from_sample("L1", "day", "WO-1", Sample::default(), at);
        assert_eq!(record.temperature, 0.0);
        assert_eq!(record.current, 0.0);
        assert!(record.time.ends_with('Z'));
        assert_eq!(
            DateTime::parse_from_rfc3339(&record.time).unwrap(),
            at.fixed_offset()
        );
    }

    #[test]
    fn values_are_rounded() {
        let at = Local::now();
        let sample = Sample {
            temperature: Some(21.123456),
            current: Some(3.0),
        };
        let record = Record::from_sample("L1", "day", "", sample, at);
        assert_eq!(record.temperature, 21.123);
        assert_eq!(record.current, 3.0);
    }

    #[test]
    fn payload_serializes_expected_keys() {
        let record = Record::from_sample("L1", "night", "WO-9", Sample::default(), Local::now());
        let json = serde_json::to_value(record.payload()).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 5);
        for key in ["line", "shift", "work_order", "temperature", "current"] {
            assert!(keys.contains(&key), "missing {key}");
        }
    }

    #[test]
    fn partition_uses_the_local_date() {
        let late = Local.with_ymd_and_hms(2025, 1, 1, 23, 59, 59).unwrap();
        let early = Local.with_ymd_and_hms(2025, 1, 2, 0, 0, 1).unwrap();
        assert_eq!(
            partition_date(&format_timestamp(late)),
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
        assert_eq!(
            partition_date(&format_timestamp(early)),
            NaiveDate::from_ymd_opt(2025, 1, 2)
        );
        assert_eq!(partition_date("garbage"), None);
    }

    #[test]
    fn stored_form_orders_across_an_offset_change() {
        // 01:50 EDT is earlier than 01:10 EST on the night clocks fall back.
        let before = normalize_timestamp("2025-11-02T01:50:00.000-04:00").unwrap();
        let after = normalize_timestamp("2025-11-02T01:10:00.000-05:00").unwrap();
        assert_eq!(before, "2025-11-02T05:50:00.000Z");
        assert_eq!(after, "2025-11-02T06:10:00.000Z");
        assert!(before < after);
        assert_eq!(normalize_timestamp("garbage"), None);
    }
}
