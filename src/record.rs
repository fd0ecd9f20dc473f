use crate::config::DeviceConfig;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Key used to address a record when marking it synced.
///
/// The scan instant doubles as the identifier, so two scans that land on the
/// same instant share a key and are marked together.
pub type RecordKey = DateTime<Utc>;

/// One card-scan event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub card_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub device_name: String,
    pub location: String,
    /// Only ever moves from false to true
    #[serde(default)]
    pub synced: bool,
}

impl AttendanceRecord {
    /// Create an unsynced record stamped with this device's identity.
    ///
    /// The timestamp is truncated to microseconds so it survives the wire
    /// format unchanged and still matches when the remote echoes it back.
    pub fn new(card_id: impl Into<String>, timestamp: DateTime<Utc>, device: &DeviceConfig) -> Self {
        Self {
            card_id: card_id.into(),
            timestamp: timestamp.trunc_subsecs(6),
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            location: device.location.clone(),
            synced: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        self.timestamp
    }

    /// Timestamp in the form sent over the wire
    pub fn timestamp_string(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

/// RFC 3339 with microsecond precision and a `Z` suffix
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp as echoed back by the remote.
///
/// Accepts RFC 3339 with any offset, and a bare ISO-8601 date-time which is
/// taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Collect the keys of a slice of records
pub fn keys_of(records: &[AttendanceRecord]) -> HashSet<RecordKey> {
    records.iter().map(AttendanceRecord::key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanlogConfig;
    use chrono::TimeZone;

    #[test]
    fn test_new_record_is_unsynced() {
        let config = ScanlogConfig::default();
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap();
        let record = AttendanceRecord::new("0012345678", ts, &config.device);

        assert!(!record.synced);
        assert_eq!(record.device_id, "edge-001");
        assert_eq!(record.key(), ts);
    }

    #[test]
    fn test_missing_synced_field_defaults_to_false() {
        let json = r#"{
            "card_id": "42",
            "timestamp": "2024-01-15T08:30:00Z",
            "device_id": "d",
            "device_name": "n",
            "location": "l"
        }"#;
        let record: AttendanceRecord = serde_json::from_str(json).unwrap();
        assert!(!record.synced);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-01-15T08:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T09:30:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("not a time"), None);
    }

    #[test]
    fn test_format_timestamp_parses_back() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let formatted = format_timestamp(&ts);

        assert_eq!(formatted, "2024-01-15T08:30:00.123456Z");
        assert_eq!(parse_timestamp(&formatted), Some(ts));
    }

    #[test]
    fn test_new_truncates_to_microseconds() {
        let config = ScanlogConfig::default();
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(1_234_567);
        let record = AttendanceRecord::new("7", ts, &config.device);

        assert_eq!(parse_timestamp(&record.timestamp_string()), Some(record.key()));
    }
}
