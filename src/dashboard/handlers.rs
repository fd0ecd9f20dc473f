use crate::error::StoreError;
use crate::events::ScanlogEvent;
use crate::export::{self, ExportFormat};
use crate::orchestrator::{DrainTrigger, SkipReason};
use crate::record::AttendanceRecord;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{Duration, Timelike, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use super::server::DashboardState;

const DEFAULT_PAGE_SIZE: usize = 100;
const REPORTED_ERRORS: usize = 5;

/// JSON error body with a status code
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("Store request failed: {}", e);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `?synced=` is true only for a case-insensitive "true"
fn synced_filter(raw: Option<&str>) -> Option<bool> {
    raw.map(|s| s.eq_ignore_ascii_case("true"))
}

fn offline() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "success": false, "message": "Backend is offline" })),
    )
        .into_response()
}

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn status_handler(State(state): State<DashboardState>) -> ApiResult<Json<Value>> {
    let status = state.orchestrator.status().await?;
    let components = state.component_states.lock().await.clone();

    let mut body = serde_json::to_value(&status)?;
    body["components"] = serde_json::to_value(&components)?;
    body["timestamp"] = json!(Utc::now());
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    synced: Option<String>,
    search: Option<String>,
}

pub async fn records_handler(
    State(state): State<DashboardState>,
    Query(query): Query<RecordsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    let mut records = export::select(
        state.orchestrator.store().all().await?,
        synced_filter(query.synced.as_deref()),
    );
    if let Some(search) = query.search.filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        records.retain(|r| r.card_id.to_lowercase().contains(&needle));
    }

    let total = records.len();
    let page: Vec<AttendanceRecord> = records.into_iter().skip(offset).take(limit).collect();

    Ok(Json(json!({
        "records": page,
        "total": total,
        "limit": limit,
        "offset": offset,
        "has_more": offset.saturating_add(limit) < total,
    })))
}

pub async fn unsynced_records_handler(
    State(state): State<DashboardState>,
) -> ApiResult<Json<Value>> {
    let records = state.orchestrator.store().unsynced().await?;
    Ok(Json(json!({
        "count": records.len(),
        "records": records,
    })))
}

/// Scan counts for today and the last hour, with today's scans bucketed by
/// local hour
pub async fn records_stats_handler(
    State(state): State<DashboardState>,
) -> ApiResult<Json<Value>> {
    let store = state.orchestrator.store();
    let records = store.all().await?;
    let stats = store.stats().await?;

    let now = Utc::now();
    let today = now.with_timezone(&state.timezone).date_naive();
    let hour_ago = now - Duration::hours(1);

    let mut hourly: BTreeMap<String, usize> =
        (0..24).map(|hour| (format!("{:02}", hour), 0)).collect();
    let mut today_count = 0;
    let mut last_hour_count = 0;

    for record in &records {
        let local = record.timestamp.with_timezone(&state.timezone);
        if local.date_naive() == today {
            today_count += 1;
            *hourly.entry(format!("{:02}", local.hour())).or_default() += 1;
        }
        if record.timestamp >= hour_ago {
            last_hour_count += 1;
        }
    }

    Ok(Json(json!({
        "total_records": stats.total_records,
        "synced_records": stats.synced_records,
        "unsynced_records": stats.unsynced_records,
        "today_count": today_count,
        "last_hour_count": last_hour_count,
        "hourly_distribution": hourly,
        "timezone": state.timezone.name(),
        "storage_capacity": stats.max_capacity,
        "storage_usage_percent": stats.usage_percent(),
    })))
}

pub async fn trigger_sync_handler(State(state): State<DashboardState>) -> ApiResult<Response> {
    info!("Manual sync requested from dashboard");
    let report = state.orchestrator.drain(DrainTrigger::Manual).await?;

    let response = match report.skipped {
        Some(SkipReason::Offline) => offline(),
        Some(_) => Json(json!({
            "success": true,
            "message": "No records to sync",
            "synced": 0,
        }))
        .into_response(),
        None => {
            let errors: Vec<_> = report.errors.iter().take(REPORTED_ERRORS).collect();
            Json(json!({
                "success": report.succeeded > 0,
                "synced": report.succeeded,
                "failed": report.failed,
                "marked": report.marked,
                "cleared": report.cleared,
                "errors": errors,
            }))
            .into_response()
        }
    };
    Ok(response)
}

pub async fn sync_config_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.orchestrator.engine().sync_config())
}

pub async fn clear_storage_handler(State(state): State<DashboardState>) -> ApiResult<Json<Value>> {
    let removed = state.orchestrator.clear_synced().await?;
    info!("Cleared {} synced records from dashboard", removed);

    Ok(Json(json!({
        "success": true,
        "removed": removed,
        "message": format!("Cleared {} synced records", removed),
    })))
}

pub async fn register_device_handler(State(state): State<DashboardState>) -> Response {
    match state.orchestrator.register_device().await {
        Ok(success) => Json(json!({
            "success": success,
            "message": if success {
                "Device registered successfully"
            } else {
                "Registration failed"
            },
        }))
        .into_response(),
        Err(_) => offline(),
    }
}

pub async fn device_info_handler(State(state): State<DashboardState>) -> Response {
    match state.orchestrator.engine().device_info().await {
        Some(info) => Json(info).into_response(),
        None => ApiError::new(StatusCode::BAD_GATEWAY, "Device information unavailable")
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    format: Option<String>,
    synced: Option<String>,
}

pub async fn export_handler(
    State(state): State<DashboardState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let format: ExportFormat = query
        .format
        .as_deref()
        .unwrap_or("csv")
        .parse()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;

    let records = export::select(
        state.orchestrator.store().all().await?,
        synced_filter(query.synced.as_deref()),
    );

    let now = Utc::now();
    let body = export::render(&records, format, now)?;
    let disposition = format!(
        "attachment; filename={}",
        export::file_name(format, now)
    );

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn config_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

/// Relay bus events as server-sent events until the dashboard shuts down
pub async fn events_handler(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!("Event stream client connected");
    let mut events = state.orchestrator.events().subscribe();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.recv() => next,
            };
            match next {
                Ok(event) => yield event_to_sse(&event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Event stream client lagged by {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_to_sse(event: &ScanlogEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.event_type()).json_data(event)
}
