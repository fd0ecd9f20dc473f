use super::transport::{HttpTransport, RemoteResponse, Transport};
use super::wire::{
    BatchRequest, BatchResults, HeartbeatMetadata, HeartbeatRequest, RegisterMetadata,
    RegisterRequest, RemoteAttendance, BATCH_PATH, CHECKIN_PATH, HEALTH_PATH, HEARTBEAT_PATH,
    INFO_PATH, REGISTER_PATH,
};
use crate::config::{DeviceConfig, ScanlogConfig, SyncMode, SyncSettings};
use crate::error::SyncError;
use crate::record::{format_timestamp, keys_of, parse_timestamp, AttendanceRecord, RecordKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Advisory connectivity bookkeeping. Never persisted and never used to
/// decide whether a record is synced.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SyncState {
    pub is_online: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// One record the remote reported as failed
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordError {
    pub key: Option<RecordKey>,
    pub card_id: Option<String>,
    pub reason: String,
}

/// Outcome of one or more batch deliveries
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BatchResult {
    pub success_count: usize,
    pub fail_count: usize,
    /// Keys the remote confirmed, in delivery order
    pub synced_ids: Vec<RecordKey>,
    pub errors: Vec<RecordError>,
}

impl BatchResult {
    fn all_failed(count: usize) -> Self {
        Self {
            fail_count: count,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: BatchResult) {
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.synced_ids.extend(other.synced_ids);
        self.errors.extend(other.errors);
    }
}

/// Effective sync configuration as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct SyncConfigView {
    pub mode: SyncMode,
    pub batch_size: usize,
    pub sync_interval: u64,
    pub min_records_for_sync: usize,
    pub chunk_delay_ms: u64,
    pub cleanup_after_sync: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_online: bool,
}

/// Delivers records to the remote attendance API.
///
/// Every call is independent; the only state kept is the advisory
/// [`SyncState`]. Failures never escape as errors: they are logged and show up
/// as `false` or as failed counts, and the records stay queued.
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    device: DeviceConfig,
    settings: SyncSettings,
    timeout: Duration,
    state: RwLock<SyncState>,
    span: Span,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        device: DeviceConfig,
        settings: SyncSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            device,
            settings,
            timeout,
            state: RwLock::new(SyncState::default()),
            span: Span::none(),
        }
    }

    /// Engine talking HTTP to the configured server
    pub fn from_config(config: &ScanlogConfig) -> Result<Self, SyncError> {
        let transport = HttpTransport::new(
            config.server.api_url.clone(),
            config.server.api_key.clone(),
            config.device.id.clone(),
        )?;

        Ok(Self::new(
            Arc::new(transport),
            config.device.clone(),
            SyncSettings::from_config(config),
            Duration::from_secs(config.server.timeout_seconds),
        ))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Query the health endpoint. Online iff it answers 200.
    pub async fn check_connection(&self) -> bool {
        async {
            let result = self.transport.get(HEALTH_PATH, self.timeout).await;
            let online = match &result {
                Ok(response) if response.status == 200 => {
                    let status = response
                        .json()
                        .and_then(|body| {
                            body.pointer("/device/status")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .unwrap_or_else(|| "unknown".to_string());
                    info!("Backend API is reachable, device status: {}", status);
                    true
                }
                Ok(response) => {
                    warn!("Backend API returned status {}", response.status);
                    false
                }
                Err(e) => {
                    warn!("Backend API unreachable: {}", e);
                    false
                }
            };

            let mut state = self.state.write();
            state.is_online = online;
            state.last_check = Some(Utc::now());
            online
        }
        .instrument(self.span.clone())
        .await
    }

    /// Send one record to the single check-in endpoint
    pub async fn send_one(&self, record: &AttendanceRecord) -> bool {
        async {
            let body = match serde_json::to_value(RemoteAttendance::from(record)) {
                Ok(body) => body,
                Err(e) => {
                    error!("Failed to encode record {}: {}", record.card_id, e);
                    return false;
                }
            };

            match self.transport.post(CHECKIN_PATH, &body, self.timeout).await {
                Ok(response) if response.is_accepted() => {
                    let status = response
                        .json()
                        .and_then(|b| b.get("status").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    info!("Attendance synced: {} ({})", record.card_id, status);
                    true
                }
                Ok(response) => {
                    error!("Failed to sync attendance {}: {}", record.card_id, response.rejection());
                    false
                }
                Err(e) => {
                    error!("Error syncing attendance {}: {}", record.card_id, e);
                    false
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Deliver `records` in one request and read back per-record outcomes
    pub async fn send_batch(&self, records: &[AttendanceRecord]) -> BatchResult {
        if records.is_empty() {
            return BatchResult::default();
        }

        async {
            let body = match serde_json::to_value(BatchRequest::new(records)) {
                Ok(body) => body,
                Err(e) => {
                    error!("Failed to encode batch: {}", e);
                    return BatchResult::all_failed(records.len());
                }
            };

            let response = match self
                .transport
                .post(BATCH_PATH, &body, self.timeout * 2)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("Error in batch sync: {}", e);
                    return BatchResult::all_failed(records.len());
                }
            };

            if !response.is_success() {
                error!("Batch sync failed: {}", response.rejection());
                return BatchResult::all_failed(records.len());
            }

            let result = interpret_batch_response(records, &response);
            info!(
                "Batch sync: {} successful, {} failed",
                result.success_count, result.fail_count
            );
            self.state.write().last_sync = Some(Utc::now());
            result
        }
        .instrument(self.span.clone())
        .await
    }

    /// Deliver `records` as consecutive batches of at most `chunk_size`.
    ///
    /// Chunks go out in order, one at a time, with the configured delay
    /// between them. A failed chunk does not stop the rest.
    pub async fn sync_in_chunks(&self, records: &[AttendanceRecord], chunk_size: usize) -> BatchResult {
        let mut total = BatchResult::default();
        if records.is_empty() {
            return total;
        }

        let chunk_size = chunk_size.max(1);
        let total_chunks = records.len().div_ceil(chunk_size);

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            self.span.in_scope(|| {
                info!(
                    "Processing chunk {}/{} ({} records)",
                    index + 1,
                    total_chunks,
                    chunk.len()
                )
            });

            total.merge(self.send_batch(chunk).await);

            if index + 1 < total_chunks && !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
        }

        self.span.in_scope(|| {
            info!(
                "Chunk sync complete: {} successful, {} failed",
                total.success_count, total.fail_count
            )
        });
        total
    }

    /// Best-effort liveness ping
    pub async fn heartbeat(&self) -> bool {
        let request = HeartbeatRequest {
            status: "online",
            metadata: HeartbeatMetadata {
                timestamp: format_timestamp(&Utc::now()),
                uptime: system_uptime(),
            },
        };

        async {
            match self.post_json(HEARTBEAT_PATH, &request).await {
                Ok(response) if response.status == 200 => {
                    debug!("Heartbeat sent");
                    true
                }
                Ok(response) => {
                    warn!("Heartbeat failed, status {}", response.status);
                    false
                }
                Err(e) => {
                    warn!("Heartbeat error: {}", e);
                    false
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Upsert this device's identity on the remote
    pub async fn register_device(&self) -> bool {
        let request = RegisterRequest {
            device_id: &self.device.id,
            device_name: &self.device.name,
            location: &self.device.location,
            metadata: RegisterMetadata {
                registered_at: format_timestamp(&Utc::now()),
                software_version: env!("CARGO_PKG_VERSION"),
                device_type: &self.device.device_type,
            },
        };

        async {
            match self.post_json(REGISTER_PATH, &request).await {
                Ok(response) if response.is_accepted() => {
                    let name = response
                        .json()
                        .and_then(|b| {
                            b.pointer("/device/name")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .unwrap_or_else(|| self.device.name.clone());
                    info!("Device registered: {}", name);
                    true
                }
                Ok(response) => {
                    error!("Device registration failed: {}", response.rejection());
                    false
                }
                Err(e) => {
                    error!("Error registering device: {}", e);
                    false
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// The remote's view of this device, if it answers
    pub async fn device_info(&self) -> Option<Value> {
        async {
            match self.transport.get(INFO_PATH, self.timeout).await {
                Ok(response) if response.status == 200 => response.json(),
                Ok(response) => {
                    error!("Failed to get device info, status {}", response.status);
                    None
                }
                Err(e) => {
                    error!("Error getting device info: {}", e);
                    None
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    pub fn sync_state(&self) -> SyncState {
        self.state.read().clone()
    }

    pub fn sync_config(&self) -> SyncConfigView {
        let state = self.state.read();
        SyncConfigView {
            mode: self.settings.mode,
            batch_size: self.settings.batch_size,
            sync_interval: self.settings.interval.as_secs(),
            min_records_for_sync: self.settings.min_records_for_sync,
            chunk_delay_ms: self.settings.chunk_delay.as_millis() as u64,
            cleanup_after_sync: self.settings.cleanup_after_sync,
            last_sync: state.last_sync,
            is_online: state.is_online,
        }
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<RemoteResponse, SyncError> {
        let body = serde_json::to_value(body).map_err(|e| SyncError::Client {
            details: e.to_string(),
        })?;
        self.transport.post(path, &body, self.timeout).await
    }
}

/// Turn a 2xx batch answer into a result for `chunk`.
///
/// Only entries flagged `success: true` whose timestamp parses and belongs to
/// the chunk count as synced, and `synced_ids` follows the chunk's order.
/// Only an answer with no `results` at all is taken as accepting the whole
/// chunk.
fn interpret_batch_response(chunk: &[AttendanceRecord], response: &RemoteResponse) -> BatchResult {
    let Some(results) = BatchResults::from_body(&response.body) else {
        debug!("Batch response carries no results, treating chunk as accepted");
        return BatchResult {
            success_count: chunk.len(),
            synced_ids: dedup_in_order(chunk.iter().map(AttendanceRecord::key)),
            ..BatchResult::default()
        };
    };

    let known = keys_of(chunk);
    let mut confirmed = HashSet::new();
    for outcome in results.records.iter().filter(|o| o.success) {
        match outcome.timestamp.as_deref().and_then(parse_timestamp) {
            Some(key) if known.contains(&key) => {
                confirmed.insert(key);
            }
            Some(key) => warn!(
                "Remote confirmed {} which is not part of this batch, ignoring",
                format_timestamp(&key)
            ),
            None => warn!(
                "Remote confirmed card {:?} without a usable timestamp, leaving it unsynced",
                outcome.card_id
            ),
        }
    }
    let synced_ids = dedup_in_order(
        chunk
            .iter()
            .map(AttendanceRecord::key)
            .filter(|key| confirmed.contains(key)),
    );

    let errors: Vec<RecordError> = results
        .errors
        .into_iter()
        .map(|failure| RecordError {
            key: failure.timestamp.as_deref().and_then(parse_timestamp),
            card_id: failure.card_id,
            reason: failure.error.unwrap_or_else(|| "Unknown error".to_string()),
        })
        .collect();

    let success_count = results.successful.unwrap_or(synced_ids.len());
    let fail_count = results
        .failed
        .unwrap_or_else(|| chunk.len().saturating_sub(synced_ids.len()));

    BatchResult {
        success_count,
        fail_count,
        synced_ids,
        errors,
    }
}

fn dedup_in_order(keys: impl Iterator<Item = RecordKey>) -> Vec<RecordKey> {
    let mut seen = HashSet::new();
    keys.filter(|key| seen.insert(*key)).collect()
}

/// Host uptime from `/proc/uptime` as `"<h>h <m>m"`
fn system_uptime() -> String {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|raw| raw.split_whitespace().next()?.parse::<f64>().ok())
        .map(|seconds| {
            let seconds = seconds as u64;
            format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
        })
        .unwrap_or_else(|| "unknown".to_string())
}
