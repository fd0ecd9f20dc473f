use super::*;
use crate::config::{ScanlogConfig, SyncMode, SyncSettings};
use crate::events::ScanlogEvent;
use crate::record::AttendanceRecord;
use crate::store::RecordStore;
use crate::sync::wire::{BATCH_PATH, CHECKIN_PATH};
use crate::sync::{ScriptedTransport, SyncEngine};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestApp {
    app: ScanlogApp,
    transport: Arc<ScriptedTransport>,
    store_path: PathBuf,
    _dir: TempDir,
}

async fn create_test_app(configure: impl FnOnce(&mut ScanlogConfig)) -> TestApp {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("records.json");

    let mut config = ScanlogConfig::default();
    config.storage.path = store_path.display().to_string();
    config.dashboard.enabled = false;
    config.sync.chunk_delay_ms = 0;
    config.sync.interval_seconds = 3600;
    configure(&mut config);

    let transport = Arc::new(ScriptedTransport::online());
    let engine = SyncEngine::new(
        transport.clone(),
        config.device.clone(),
        SyncSettings::from_config(&config),
        Duration::from_secs(2),
    );

    let mut app = ScanlogApp::with_engine(config, engine).await.unwrap();
    app.set_reader_enabled(false);

    TestApp {
        app,
        transport,
        store_path,
        _dir: dir,
    }
}

fn scan(card_id: &str, second: u32) -> AttendanceRecord {
    let ts = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, second).unwrap();
    AttendanceRecord::new(card_id, ts, &ScanlogConfig::default().device)
}

fn stored(path: &PathBuf) -> Vec<AttendanceRecord> {
    RecordStore::open(path, 100).unwrap().all().unwrap()
}

#[tokio::test]
async fn test_initialize_registers_components() {
    let mut t = create_test_app(|_| {}).await;
    t.app.initialize().await.unwrap();

    assert_eq!(
        t.app.component_state("store").await,
        Some(ComponentState::Running)
    );
    assert_eq!(
        t.app.component_state("periodic_sync").await,
        Some(ComponentState::Stopped)
    );
    // Batch mode has no immediate worker and the reader is disabled
    assert_eq!(t.app.component_state("immediate_sync").await, None);
    assert_eq!(t.app.component_state("reader").await, None);
    assert_eq!(t.app.component_state("dashboard").await, None);
}

#[tokio::test]
async fn test_start_and_shutdown() {
    let mut t = create_test_app(|_| {}).await;
    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    assert!(t.app.scan_sender().is_some());
    assert_eq!(
        t.app.component_state("ingest").await,
        Some(ComponentState::Running)
    );

    let exit_code = t.app.shutdown().await.unwrap();
    assert_eq!(exit_code, 0);
    assert!(t.app.scan_sender().is_none());

    let states = t.app.component_states();
    let states = states.lock().await;
    for name in ["ingest", "periodic_sync", "store"] {
        assert_eq!(states.get(name), Some(&ComponentState::Stopped), "{}", name);
    }
}

#[tokio::test]
async fn test_start_survives_offline_backend() {
    let mut t = create_test_app(|_| {}).await;
    t.transport.set_offline(true);

    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    let exit_code = t.app.shutdown().await.unwrap();
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn test_queued_scans_are_stored_before_exit() {
    let mut t = create_test_app(|_| {}).await;
    t.transport.set_offline(true);
    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    let sender = t.app.scan_sender().unwrap();
    sender.send(scan("A", 0)).await.unwrap();
    sender.send(scan("B", 1)).await.unwrap();
    drop(sender);

    t.app.shutdown().await.unwrap();

    let records = stored(&t.store_path);
    let cards: Vec<_> = records.iter().map(|r| r.card_id.as_str()).collect();
    assert_eq!(cards, vec!["A", "B"]);
    assert!(records.iter().all(|r| !r.synced));
}

#[tokio::test]
async fn test_shutdown_runs_final_sync() {
    let mut t = create_test_app(|c| {
        c.sync.min_records_for_sync = 50;
        c.storage.cleanup_after_sync = false;
    })
    .await;
    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    let records = vec![scan("A", 0), scan("B", 1)];
    for record in &records {
        t.app.orchestrator().ingest(record.clone()).await.unwrap();
    }

    let entries: Vec<_> = records
        .iter()
        .map(|r| json!({"timestamp": r.timestamp_string(), "card_id": r.card_id, "success": true}))
        .collect();
    t.transport.push(
        BATCH_PATH,
        200,
        json!({"results": {"successful": 2, "failed": 0, "records": entries}}).to_string(),
    );

    t.app.shutdown().await.unwrap();

    assert_eq!(t.transport.requests_to(BATCH_PATH).len(), 1);
    let records = stored(&t.store_path);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.synced));
}

#[tokio::test]
async fn test_immediate_mode_worker_lifecycle() {
    let mut t = create_test_app(|c| c.sync.mode = SyncMode::Immediate).await;
    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    assert_eq!(
        t.app.component_state("immediate_sync").await,
        Some(ComponentState::Running)
    );

    t.transport.push(CHECKIN_PATH, 201, r#"{"id": 1}"#);
    t.app.orchestrator().ingest(scan("A", 0)).await.unwrap();

    let mut delivered = false;
    for _ in 0..50 {
        if !t.transport.requests_to(CHECKIN_PATH).is_empty() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered);

    assert_eq!(t.app.shutdown().await.unwrap(), 0);
    assert_eq!(
        t.app.component_state("immediate_sync").await,
        Some(ComponentState::Stopped)
    );
}

#[tokio::test]
async fn test_run_returns_on_shutdown_request() {
    let mut t = create_test_app(|_| {}).await;
    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    let bus = Arc::clone(t.app.event_bus());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(ScanlogEvent::ShutdownRequested {
            timestamp: Utc::now(),
            reason: "test".to_string(),
        })
        .await
        .unwrap();
    });

    let exit_code = tokio::time::timeout(Duration::from_secs(10), t.app.run())
        .await
        .expect("run did not return")
        .unwrap();
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn test_run_twice_fails() {
    let mut t = create_test_app(|_| {}).await;
    t.app.initialize().await.unwrap();
    t.app.start().await.unwrap();

    t.app.event_bus()
        .publish(ScanlogEvent::ShutdownRequested {
            timestamp: Utc::now(),
            reason: "first".to_string(),
        })
        .await
        .unwrap();
    t.app.run().await.unwrap();

    assert!(t.app.run().await.is_err());
}
