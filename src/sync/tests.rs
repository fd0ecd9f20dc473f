use super::wire::{BATCH_PATH, CHECKIN_PATH, HEALTH_PATH, HEARTBEAT_PATH, INFO_PATH, REGISTER_PATH};
use super::*;
use crate::config::{ScanlogConfig, SyncSettings};
use crate::error::SyncError;
use crate::record::AttendanceRecord;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn record(card_id: &str, second: u32) -> AttendanceRecord {
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, second).unwrap();
    AttendanceRecord::new(card_id, ts, &ScanlogConfig::default().device)
}

fn engine(transport: &Arc<ScriptedTransport>) -> SyncEngine {
    engine_with_delay(transport, Duration::ZERO)
}

fn engine_with_delay(transport: &Arc<ScriptedTransport>, delay: Duration) -> SyncEngine {
    let config = ScanlogConfig::default();
    let mut settings = SyncSettings::from_config(&config);
    settings.chunk_delay = delay;
    SyncEngine::new(
        transport.clone(),
        config.device.clone(),
        settings,
        Duration::from_secs(5),
    )
}

/// Batch answer accepting every record in `records`
fn accept_all(records: &[AttendanceRecord]) -> String {
    let entries: Vec<_> = records
        .iter()
        .map(|r| json!({"timestamp": r.timestamp_string(), "card_id": r.card_id, "success": true}))
        .collect();
    json!({"results": {"successful": records.len(), "failed": 0, "records": entries, "errors": []}})
        .to_string()
}

fn sent_timestamps(request: &mock::RecordedRequest) -> Vec<String> {
    request.body.as_ref().unwrap()["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["timestamp"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_check_connection_online() {
    let transport = Arc::new(ScriptedTransport::online());
    let engine = engine(&transport);

    assert!(engine.sync_state().last_check.is_none());
    assert!(engine.check_connection().await);

    let state = engine.sync_state();
    assert!(state.is_online);
    assert!(state.last_check.is_some());
    assert_eq!(transport.requests_to(HEALTH_PATH)[0].method, "GET");
}

#[tokio::test]
async fn test_check_connection_offline_is_not_an_error() {
    let transport = Arc::new(ScriptedTransport::online());
    transport.set_offline(true);
    let engine = engine(&transport);

    assert!(!engine.check_connection().await);
    let state = engine.sync_state();
    assert!(!state.is_online);
    assert!(state.last_check.is_some());
}

#[tokio::test]
async fn test_check_connection_requires_200() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(HEALTH_PATH, 401, r#"{"message": "Invalid API key"}"#);
    transport.push(HEALTH_PATH, 204, "");
    let engine = engine(&transport);

    assert!(!engine.check_connection().await);
    assert!(!engine.check_connection().await);
}

#[tokio::test]
async fn test_send_one_maps_to_remote_schema() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(CHECKIN_PATH, 201, r#"{"status": "CHECKED_IN"}"#);
    let engine = engine(&transport);
    let scan = record("0012345678", 0);

    assert!(engine.send_one(&scan).await);

    let sent = transport.requests_to(CHECKIN_PATH);
    let body = sent[0].body.as_ref().unwrap();
    assert_eq!(body["cardNumber"], "0012345678");
    assert_eq!(body["date"], scan.timestamp_string());
    assert_eq!(body["location"], "Main Entrance");
}

#[tokio::test]
async fn test_send_one_failures_collapse_to_false() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(CHECKIN_PATH, 404, r#"{"message": "Card not found"}"#);
    transport.push(CHECKIN_PATH, 503, "unavailable");
    transport.push_error(
        CHECKIN_PATH,
        SyncError::Connectivity {
            details: "timed out".to_string(),
        },
    );
    let engine = engine(&transport);
    let scan = record("A", 0);

    assert!(!engine.send_one(&scan).await);
    assert!(!engine.send_one(&scan).await);
    assert!(!engine.send_one(&scan).await);
}

#[tokio::test]
async fn test_send_batch_empty_sends_nothing() {
    let transport = Arc::new(ScriptedTransport::new());
    let engine = engine(&transport);

    let result = engine.send_batch(&[]).await;
    assert_eq!(result, BatchResult::default());
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_send_batch_partial_result() {
    let transport = Arc::new(ScriptedTransport::new());
    let records = vec![record("A", 0), record("B", 1), record("C", 2)];
    let body = json!({
        "results": {
            "successful": 2,
            "failed": 1,
            "records": [
                {"timestamp": records[0].timestamp_string(), "card_id": "A", "success": true},
                {"timestamp": records[1].timestamp_string(), "card_id": "B", "success": false},
                {"timestamp": records[2].timestamp_string(), "card_id": "C", "success": true}
            ],
            "errors": [
                {"card_id": "B", "timestamp": records[1].timestamp_string(), "error": "Card not registered"}
            ]
        }
    });
    transport.push(BATCH_PATH, 200, body.to_string());
    let engine = engine(&transport);

    let result = engine.send_batch(&records).await;

    assert_eq!(result.success_count, 2);
    assert_eq!(result.fail_count, 1);
    assert_eq!(result.synced_ids, vec![records[0].key(), records[2].key()]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].key, Some(records[1].key()));
    assert_eq!(result.errors[0].reason, "Card not registered");
    assert!(engine.sync_state().last_sync.is_some());
}

#[tokio::test]
async fn test_send_batch_without_results_assumes_success() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(BATCH_PATH, 201, r#"{"message": "ok"}"#);
    transport.push(BATCH_PATH, 200, "accepted");
    let engine = engine(&transport);
    let records = vec![record("A", 0), record("B", 1)];

    for _ in 0..2 {
        let result = engine.send_batch(&records).await;
        assert_eq!(result.success_count, 2);
        assert_eq!(result.fail_count, 0);
        assert_eq!(result.synced_ids, vec![records[0].key(), records[1].key()]);
    }
}

#[tokio::test]
async fn test_send_batch_failure_marks_nothing() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(BATCH_PATH, 500, r#"{"message": "database down"}"#);
    transport.push_error(
        BATCH_PATH,
        SyncError::Connectivity {
            details: "connection refused".to_string(),
        },
    );
    let engine = engine(&transport);
    let records = vec![record("A", 0), record("B", 1)];

    for _ in 0..2 {
        let result = engine.send_batch(&records).await;
        assert_eq!(result.success_count, 0);
        assert_eq!(result.fail_count, 2);
        assert!(result.synced_ids.is_empty());
        assert!(result.errors.is_empty());
    }
    assert!(engine.sync_state().last_sync.is_none());
}

#[tokio::test]
async fn test_send_batch_ignores_unknown_confirmations() {
    let transport = Arc::new(ScriptedTransport::new());
    let records = vec![record("A", 0)];
    let body = json!({
        "results": {
            "records": [
                {"timestamp": "2020-01-01T00:00:00Z", "card_id": "X", "success": true},
                {"card_id": "A", "success": true},
                {"timestamp": records[0].timestamp_string(), "card_id": "A", "success": true}
            ]
        }
    });
    transport.push(BATCH_PATH, 200, body.to_string());
    let engine = engine(&transport);

    let result = engine.send_batch(&records).await;

    assert_eq!(result.synced_ids, vec![records[0].key()]);
    // Counts missing from the answer are derived from the confirmations
    assert_eq!(result.success_count, 1);
    assert_eq!(result.fail_count, 0);
}

#[tokio::test]
async fn test_send_batch_mistyped_results_confirm_only_successes() {
    let transport = Arc::new(ScriptedTransport::new());
    let records = vec![record("A", 0), record("B", 1)];
    let body = json!({
        "results": {
            "successful": 0,
            "failed": "2",
            "records": [
                {"timestamp": records[0].timestamp_string(), "card_id": "A", "success": false},
                {"timestamp": records[1].timestamp_string(), "card_id": "B", "success": false}
            ],
            "errors": []
        }
    });
    transport.push(BATCH_PATH, 200, body.to_string());
    let engine = engine(&transport);

    let result = engine.send_batch(&records).await;

    assert!(result.synced_ids.is_empty());
    assert_eq!(result.success_count, 0);
    assert_eq!(result.fail_count, 2);
}

#[tokio::test]
async fn test_send_batch_malformed_results_object_marks_nothing() {
    let transport = Arc::new(ScriptedTransport::new());
    let records = vec![record("A", 0), record("B", 1)];
    transport.push(BATCH_PATH, 200, r#"{"results": "done"}"#);
    transport.push(
        BATCH_PATH,
        200,
        json!({"results": {"records": {"A": true}, "errors": "none"}}).to_string(),
    );
    let engine = engine(&transport);

    for _ in 0..2 {
        let result = engine.send_batch(&records).await;
        assert!(result.synced_ids.is_empty());
        assert_eq!(result.success_count, 0);
        assert_eq!(result.fail_count, 2);
    }
}

#[tokio::test]
async fn test_send_batch_keeps_delivery_order_of_confirmations() {
    let transport = Arc::new(ScriptedTransport::new());
    let records = vec![record("A", 0), record("B", 1), record("C", 2)];
    let body = json!({
        "results": {
            "records": [
                {"timestamp": records[2].timestamp_string(), "card_id": "C", "success": true},
                {"timestamp": records[0].timestamp_string(), "card_id": "A", "success": true},
                {"timestamp": records[0].timestamp_string(), "card_id": "A", "success": true},
                {"timestamp": records[1].timestamp_string(), "card_id": "B", "success": true}
            ]
        }
    });
    transport.push(BATCH_PATH, 200, body.to_string());
    let engine = engine(&transport);

    let result = engine.send_batch(&records).await;

    assert_eq!(
        result.synced_ids,
        vec![records[0].key(), records[1].key(), records[2].key()]
    );
    assert_eq!(result.success_count, 3);
}

#[tokio::test]
async fn test_send_batch_uses_double_timeout() {
    let transport = Arc::new(ScriptedTransport::new());
    let records = vec![record("A", 0)];
    transport.push(BATCH_PATH, 200, accept_all(&records));
    let engine = engine(&transport);

    engine.send_batch(&records).await;

    assert_eq!(
        transport.requests_to(BATCH_PATH)[0].timeout,
        Duration::from_secs(10)
    );
}

#[tokio::test]
async fn test_sync_in_chunks_issues_ceil_n_over_k_batches_in_order() {
    let transport = Arc::new(ScriptedTransport::new());
    let records: Vec<_> = (0..7).map(|i| record(&format!("card-{}", i), i)).collect();
    for chunk in records.chunks(3) {
        transport.push(BATCH_PATH, 200, accept_all(chunk));
    }
    let engine = engine(&transport);

    let result = engine.sync_in_chunks(&records, 3).await;

    let batches = transport.requests_to(BATCH_PATH);
    assert_eq!(batches.len(), 3);
    assert_eq!(
        batches.iter().map(|b| sent_timestamps(b).len()).collect::<Vec<_>>(),
        vec![3, 3, 1]
    );

    let sent: Vec<String> = batches.iter().flat_map(sent_timestamps).collect();
    let expected: Vec<String> = records.iter().map(|r| r.timestamp_string()).collect();
    assert_eq!(sent, expected);

    assert_eq!(result.success_count, 7);
    assert_eq!(
        result.synced_ids,
        records.iter().map(|r| r.key()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_sync_in_chunks_continues_after_failed_chunk() {
    let transport = Arc::new(ScriptedTransport::new());
    let a = record("A", 0);
    let b = record("B", 1);
    let c = record("C", 2);
    transport.push(BATCH_PATH, 200, accept_all(&[a.clone(), b.clone()]));
    transport.push(BATCH_PATH, 500, r#"{"message": "try later"}"#);
    let engine = engine(&transport);

    let result = engine
        .sync_in_chunks(&[a.clone(), b.clone(), c], 2)
        .await;

    assert_eq!(result.success_count, 2);
    assert_eq!(result.fail_count, 1);
    assert_eq!(result.synced_ids, vec![a.key(), b.key()]);
    assert_eq!(transport.requests_to(BATCH_PATH).len(), 2);
}

#[tokio::test]
async fn test_sync_in_chunks_waits_between_chunks_only() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_always(BATCH_PATH, 200, "{}");
    let engine = engine_with_delay(&transport, Duration::from_millis(40));
    let records: Vec<_> = (0..3).map(|i| record("A", i)).collect();

    let started = std::time::Instant::now();
    engine.sync_in_chunks(&records, 1).await;
    let elapsed = started.elapsed();

    // Two gaps for three chunks
    assert!(elapsed >= Duration::from_millis(80));

    let single = std::time::Instant::now();
    engine.sync_in_chunks(&records[..1], 1).await;
    assert!(single.elapsed() < Duration::from_millis(40));
}

#[tokio::test]
async fn test_sync_in_chunks_zero_chunk_size_sends_singles() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_always(BATCH_PATH, 200, "{}");
    let engine = engine(&transport);
    let records = vec![record("A", 0), record("B", 1)];

    let result = engine.sync_in_chunks(&records, 0).await;

    assert_eq!(transport.requests_to(BATCH_PATH).len(), 2);
    assert_eq!(result.success_count, 2);
}

#[tokio::test]
async fn test_heartbeat_and_registration_bodies() {
    let transport = Arc::new(ScriptedTransport::online());
    let engine = engine(&transport);

    assert!(engine.heartbeat().await);
    assert!(engine.register_device().await);
    assert!(engine.register_device().await);

    let heartbeat = transport.requests_to(HEARTBEAT_PATH);
    let body = heartbeat[0].body.as_ref().unwrap();
    assert_eq!(body["status"], "online");
    assert!(body["metadata"]["uptime"].is_string());

    let registrations = transport.requests_to(REGISTER_PATH);
    assert_eq!(registrations.len(), 2);
    let body = registrations[0].body.as_ref().unwrap();
    assert_eq!(body["device_id"], "edge-001");
    assert_eq!(body["metadata"]["device_type"], "ATLAS_EDGE");
    assert_eq!(body["metadata"]["software_version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_heartbeat_failure_is_swallowed() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.set_offline(true);
    let engine = engine(&transport);

    assert!(!engine.heartbeat().await);
    assert!(!engine.register_device().await);
    assert_eq!(engine.device_info().await, None);
}

#[tokio::test]
async fn test_device_info_passthrough() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(INFO_PATH, 200, r#"{"device": {"name": "Lobby"}}"#);
    let engine = engine(&transport);

    let info = engine.device_info().await.unwrap();
    assert_eq!(info["device"]["name"], "Lobby");
}

#[tokio::test]
async fn test_sync_config_reflects_settings_and_state() {
    let transport = Arc::new(ScriptedTransport::online());
    let engine = engine(&transport);
    engine.check_connection().await;

    let view = engine.sync_config();
    assert_eq!(view.batch_size, 50);
    assert_eq!(view.sync_interval, 300);
    assert_eq!(view.min_records_for_sync, 1);
    assert!(view.is_online);
    assert!(view.last_sync.is_none());
}

#[cfg(feature = "dashboard")]
mod http {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer secret-key")
            && headers.get("x-device-id").and_then(|v| v.to_str().ok()) == Some("edge-001")
    }

    async fn health(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if authorized(&headers) {
            (StatusCode::OK, Json(json!({"device": {"status": "ACTIVE"}})))
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({"message": "Invalid API key"})))
        }
    }

    async fn batch(Json(body): Json<Value>) -> Json<Value> {
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for entry in body["records"].as_array().cloned().unwrap_or_default() {
            if entry["card_id"] == "REJECT" {
                errors.push(json!({"card_id": entry["card_id"], "timestamp": entry["timestamp"], "error": "Unknown card"}));
                records.push(json!({"timestamp": entry["timestamp"], "card_id": entry["card_id"], "success": false}));
            } else {
                records.push(json!({"timestamp": entry["timestamp"], "card_id": entry["card_id"], "success": true}));
            }
        }
        Json(json!({"results": {
            "successful": records.len() - errors.len(),
            "failed": errors.len(),
            "records": records,
            "errors": errors
        }}))
    }

    async fn spawn_backend() -> String {
        let app = Router::new()
            .route("/api/device-api/health", get(health))
            .route("/api/attendance/batch", post(batch));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api", address)
    }

    #[tokio::test]
    async fn test_http_transport_against_fake_backend() {
        let base_url = spawn_backend().await;
        let config = ScanlogConfig::default();
        let mut settings = SyncSettings::from_config(&config);
        settings.chunk_delay = Duration::ZERO;

        let transport = HttpTransport::new(base_url.clone(), "secret-key", "edge-001").unwrap();
        let engine = SyncEngine::new(
            Arc::new(transport),
            config.device.clone(),
            settings.clone(),
            Duration::from_secs(5),
        );

        assert!(engine.check_connection().await);

        let records = vec![record("A", 0), record("REJECT", 1), record("C", 2)];
        let result = engine.sync_in_chunks(&records, 2).await;
        assert_eq!(result.success_count, 2);
        assert_eq!(result.fail_count, 1);
        assert_eq!(result.synced_ids, vec![records[0].key(), records[2].key()]);
        assert_eq!(result.errors[0].reason, "Unknown card");

        let wrong_key = HttpTransport::new(base_url, "wrong", "edge-001").unwrap();
        let rejected = SyncEngine::new(
            Arc::new(wrong_key),
            config.device.clone(),
            settings,
            Duration::from_secs(5),
        );
        assert!(!rejected.check_connection().await);
    }

    #[tokio::test]
    async fn test_http_transport_unreachable_is_connectivity_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(format!("http://{}/api", address), "key", "edge-001").unwrap();
        let error = transport
            .get("/device-api/health", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(error.is_connectivity());
    }
}
