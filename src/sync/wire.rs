//! Remote API request and response bodies.

use crate::record::AttendanceRecord;
use serde::Serialize;
use serde_json::{Map, Value};

pub const HEALTH_PATH: &str = "/device-api/health";
pub const REGISTER_PATH: &str = "/device-api/register";
pub const HEARTBEAT_PATH: &str = "/device-api/heartbeat";
pub const INFO_PATH: &str = "/device-api/info";
pub const CHECKIN_PATH: &str = "/attendance/auto-checkin";
pub const BATCH_PATH: &str = "/attendance/batch";

/// Single check-in in the remote's own schema
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAttendance<'a> {
    pub card_number: &'a str,
    pub date: String,
    pub location: &'a str,
}

impl<'a> From<&'a AttendanceRecord> for RemoteAttendance<'a> {
    fn from(record: &'a AttendanceRecord) -> Self {
        Self {
            card_number: &record.card_id,
            date: record.timestamp_string(),
            location: &record.location,
        }
    }
}

/// Batch entries keep the local field names
#[derive(Debug, Serialize)]
pub struct BatchEntry<'a> {
    pub card_id: &'a str,
    pub timestamp: String,
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub location: &'a str,
}

impl<'a> From<&'a AttendanceRecord> for BatchEntry<'a> {
    fn from(record: &'a AttendanceRecord) -> Self {
        Self {
            card_id: &record.card_id,
            timestamp: record.timestamp_string(),
            device_id: &record.device_id,
            device_name: &record.device_name,
            location: &record.location,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchRequest<'a> {
    pub records: Vec<BatchEntry<'a>>,
}

impl<'a> BatchRequest<'a> {
    pub fn new(records: &'a [AttendanceRecord]) -> Self {
        Self {
            records: records.iter().map(BatchEntry::from).collect(),
        }
    }
}

/// Per-record outcomes from a batch answer.
///
/// Read field by field from loose JSON: a field of the wrong type reads as
/// absent and a malformed entry is skipped, so one odd field never hides the
/// rest of the answer.
#[derive(Debug, Default, PartialEq)]
pub struct BatchResults {
    pub successful: Option<usize>,
    pub failed: Option<usize>,
    pub records: Vec<RecordOutcome>,
    pub errors: Vec<RecordFailure>,
}

#[derive(Debug, PartialEq)]
pub struct RecordOutcome {
    pub timestamp: Option<String>,
    pub card_id: Option<String>,
    /// Only a literal `true` counts
    pub success: bool,
}

#[derive(Debug, PartialEq)]
pub struct RecordFailure {
    pub card_id: Option<String>,
    pub timestamp: Option<String>,
    pub error: Option<String>,
}

impl BatchResults {
    /// `None` when the body carries no `results` at all (including bodies
    /// that are not JSON). A `results` value that is not an object yields
    /// empty results, which confirms nothing.
    pub fn from_body(body: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(body).ok()?;
        match value.get("results") {
            None | Some(Value::Null) => None,
            Some(Value::Object(results)) => Some(Self {
                successful: count(results.get("successful")),
                failed: count(results.get("failed")),
                records: entries(results.get("records"), |entry| RecordOutcome {
                    timestamp: text(entry.get("timestamp")),
                    card_id: text(entry.get("card_id")),
                    success: entry.get("success") == Some(&Value::Bool(true)),
                }),
                errors: entries(results.get("errors"), |entry| RecordFailure {
                    card_id: text(entry.get("card_id")),
                    timestamp: text(entry.get("timestamp")),
                    error: text(entry.get("error")),
                }),
            }),
            Some(_) => Some(Self::default()),
        }
    }
}

fn count(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn entries<T>(value: Option<&Value>, read: impl Fn(&Map<String, Value>) -> T) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).map(read).collect())
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
pub struct HeartbeatRequest {
    pub status: &'static str,
    pub metadata: HeartbeatMetadata,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatMetadata {
    pub timestamp: String,
    pub uptime: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub location: &'a str,
    pub metadata: RegisterMetadata<'a>,
}

#[derive(Debug, Serialize)]
pub struct RegisterMetadata<'a> {
    pub registered_at: String,
    pub software_version: &'static str,
    pub device_type: &'a str,
}
