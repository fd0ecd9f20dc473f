//! Record export shared by the dashboard and `scantool`.

use crate::record::{format_timestamp, AttendanceRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;

const CSV_HEADER: [&str; 6] = [
    "Card ID",
    "Timestamp",
    "Location",
    "Device ID",
    "Device Name",
    "Synced",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("Invalid format '{}'. Use csv or json", other)),
        }
    }
}

#[derive(Serialize)]
struct JsonExport<'a> {
    records: &'a [AttendanceRecord],
    exported_at: DateTime<Utc>,
}

/// Keep records matching `synced` (all when `None`), newest first
pub fn select(mut records: Vec<AttendanceRecord>, synced: Option<bool>) -> Vec<AttendanceRecord> {
    if let Some(synced) = synced {
        records.retain(|r| r.synced == synced);
    }
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    records
}

/// Render records in the requested format
pub fn render(
    records: &[AttendanceRecord],
    format: ExportFormat,
    exported_at: DateTime<Utc>,
) -> serde_json::Result<String> {
    match format {
        ExportFormat::Csv => Ok(to_csv(records)),
        ExportFormat::Json => serde_json::to_string_pretty(&JsonExport {
            records,
            exported_at,
        }),
    }
}

/// Download name such as `scanlog_records_20240301_090000.csv`
pub fn file_name(format: ExportFormat, at: DateTime<Utc>) -> String {
    format!(
        "scanlog_records_{}.{}",
        at.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

fn to_csv(records: &[AttendanceRecord]) -> String {
    let mut out = String::new();
    push_row(&mut out, CSV_HEADER.iter().copied());

    for record in records {
        let timestamp = format_timestamp(&record.timestamp);
        let synced = if record.synced { "Yes" } else { "No" };
        push_row(
            &mut out,
            [
                record.card_id.as_str(),
                timestamp.as_str(),
                record.location.as_str(),
                record.device_id.as_str(),
                record.device_name.as_str(),
                synced,
            ],
        );
    }
    out
}

fn push_row<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push_str("\r\n");
}
