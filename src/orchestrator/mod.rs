//! Decides when queued records are delivered and keeps the store in step
//! with what the remote confirmed.

mod report;

pub use report::{DrainReport, DrainTrigger, SkipReason};

use crate::config::{DeviceConfig, SyncMode, SyncSettings};
use crate::error::{StoreError, SyncError};
use crate::events::{EventBus, ScanlogEvent};
use crate::record::AttendanceRecord;
use crate::store::{AddOutcome, StoreHandle, StoreStats};
use crate::sync::{SyncConfigView, SyncEngine};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

const IMMEDIATE_QUEUE: usize = 256;
const LOGGED_RECORD_ERRORS: usize = 5;

/// Snapshot served to operators
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub device: DeviceConfig,
    pub backend_online: bool,
    pub last_backend_check: Option<DateTime<Utc>>,
    /// Last drain that attempted delivery
    pub last_sync: Option<DateTime<Utc>>,
    pub storage: StoreStats,
    pub sync_config: SyncConfigView,
}

/// Ties the record store to the sync engine.
///
/// The orchestrator is the only component that mutates the store. Every
/// write goes through the [`StoreHandle`], and delivery passes are serialised
/// by one lock, so the dashboard and the periodic loop never interleave their
/// read-then-mark sequences.
#[derive(Clone)]
pub struct Orchestrator {
    store: StoreHandle,
    engine: Arc<SyncEngine>,
    events: Arc<EventBus>,
    device: Arc<DeviceConfig>,
    timezone: Tz,
    drain_lock: Arc<tokio::sync::Mutex<()>>,
    last_drain: Arc<RwLock<Option<DateTime<Utc>>>>,
    immediate_tx: Option<mpsc::Sender<AttendanceRecord>>,
    immediate_rx: Arc<Mutex<Option<mpsc::Receiver<AttendanceRecord>>>>,
    span: Span,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        engine: Arc<SyncEngine>,
        events: Arc<EventBus>,
        device: DeviceConfig,
    ) -> Self {
        let (immediate_tx, immediate_rx) = if engine.settings().mode == SyncMode::Immediate {
            let (tx, rx) = mpsc::channel(IMMEDIATE_QUEUE);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Self {
            store,
            engine,
            events,
            device: Arc::new(device),
            timezone: Tz::UTC,
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_drain: Arc::new(RwLock::new(None)),
            immediate_tx,
            immediate_rx: Arc::new(Mutex::new(immediate_rx)),
            span: Span::none(),
        }
    }

    /// Timezone for human facing scan log lines
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn settings(&self) -> &SyncSettings {
        self.engine.settings()
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Durably store a scan, then queue it for immediate delivery if enabled.
    ///
    /// The write happens before anything touches the network. If it fails the
    /// record is not saved and nothing else is attempted.
    pub async fn ingest(&self, record: AttendanceRecord) -> Result<AddOutcome, StoreError> {
        self.store_and_queue(record)
            .instrument(self.span.clone())
            .await
    }

    async fn store_and_queue(&self, record: AttendanceRecord) -> Result<AddOutcome, StoreError> {
        let local = record.timestamp.with_timezone(&self.timezone);
        info!(
            card_id = %record.card_id,
            location = %record.location,
            "Attendance logged at {}",
            local.format("%Y-%m-%d %H:%M:%S %Z")
        );

        let outcome = self.store.add(record.clone()).await?;
        debug!("Saved to local storage ({} records held)", outcome.total);

        let _ = self
            .events
            .publish(ScanlogEvent::RecordStored {
                card_id: record.card_id.clone(),
                timestamp: record.timestamp,
                total_records: outcome.total,
            })
            .await;

        for evicted in &outcome.evicted {
            let _ = self
                .events
                .publish(ScanlogEvent::RecordEvicted {
                    card_id: evicted.card_id.clone(),
                    timestamp: evicted.timestamp,
                    was_synced: evicted.synced,
                })
                .await;
        }

        match &self.immediate_tx {
            Some(sender) => {
                if let Err(e) = sender.try_send(record) {
                    warn!("Immediate delivery queue unavailable ({}), record left for the next drain", e);
                }
            }
            None => debug!(
                "Record queued for the next sync in ~{}s",
                self.settings().interval.as_secs()
            ),
        }

        Ok(outcome)
    }

    /// Deliver records handed over by [`Self::ingest`] one at a time, in
    /// arrival order, until cancelled. Returns at once in batch mode.
    pub async fn run_immediate_worker(&self, token: CancellationToken) {
        let receiver = self.immediate_rx.lock().take();
        let Some(mut receiver) = receiver else {
            debug!("Immediate delivery worker not needed");
            return;
        };

        self.span.in_scope(|| info!("Immediate delivery worker started"));
        loop {
            let record = tokio::select! {
                _ = token.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };
            self.deliver_immediately(&record).await;
        }
        self.span.in_scope(|| info!("Immediate delivery worker stopped"));
    }

    /// Check connectivity, send one record, and mark it synced on acceptance.
    ///
    /// Returns whether the record was confirmed. Anything else leaves it for
    /// the periodic path.
    pub async fn deliver_immediately(&self, record: &AttendanceRecord) -> bool {
        async {
            let _guard = self.drain_lock.lock().await;

            if !self.check_online().await {
                info!("Backend offline, {} will sync in batch later", record.card_id);
                return false;
            }

            if !self.engine.send_one(record).await {
                warn!("Failed to sync {} immediately, will retry in batch", record.card_id);
                return false;
            }

            let keys: HashSet<_> = [record.key()].into_iter().collect();
            match self.store.mark_synced(keys).await {
                Ok(marked) => {
                    info!("Synced to backend immediately");
                    if marked > 0 {
                        let _ = self
                            .events
                            .publish(ScanlogEvent::RecordsSynced { count: marked })
                            .await;
                        self.cleanup_if_enabled().await;
                    }
                    true
                }
                Err(e) => {
                    error!("Delivered {} but could not mark it synced: {}", record.card_id, e);
                    false
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Push every unsynced record to the remote in chunks and record which
    /// ones were accepted.
    ///
    /// Skips the whole pass when offline. Only store failures are returned
    /// as errors; delivery failures show up in the report.
    pub async fn drain(&self, trigger: DrainTrigger) -> Result<DrainReport, StoreError> {
        self.drain_pass(trigger)
            .instrument(self.span.clone())
            .await
    }

    async fn drain_pass(&self, trigger: DrainTrigger) -> Result<DrainReport, StoreError> {
        let _guard = self.drain_lock.lock().await;
        let settings = self.settings().clone();

        if !self.check_online().await {
            debug!("Backend offline, skipping {} sync", trigger);
            return Ok(DrainReport::skipped(trigger, false, SkipReason::Offline, 0));
        }

        let pending = self.store.unsynced().await?;
        if pending.is_empty() {
            debug!("No unsynced records to sync");
            return Ok(DrainReport::skipped(trigger, true, SkipReason::NothingPending, 0));
        }

        if trigger.honours_threshold() && pending.len() < settings.min_records_for_sync {
            debug!(
                "Only {} records pending, minimum is {}",
                pending.len(),
                settings.min_records_for_sync
            );
            return Ok(DrainReport::skipped(
                trigger,
                true,
                SkipReason::BelowThreshold,
                pending.len(),
            ));
        }

        info!(
            "Syncing {} records in chunks of {} ({})",
            pending.len(),
            settings.batch_size,
            trigger
        );
        let result = self
            .engine
            .sync_in_chunks(&pending, settings.batch_size)
            .await;

        let marked = if result.synced_ids.is_empty() {
            0
        } else {
            self.store
                .mark_synced(result.synced_ids.iter().copied().collect())
                .await?
        };
        if marked > 0 {
            let _ = self
                .events
                .publish(ScanlogEvent::RecordsSynced { count: marked })
                .await;
        }

        for failure in result.errors.iter().take(LOGGED_RECORD_ERRORS) {
            warn!(
                "Sync error for {}: {}",
                failure.card_id.as_deref().unwrap_or("unknown"),
                failure.reason
            );
        }
        if result.errors.len() > LOGGED_RECORD_ERRORS {
            warn!(
                "...and {} more errors",
                result.errors.len() - LOGGED_RECORD_ERRORS
            );
        }

        *self.last_drain.write() = Some(Utc::now());

        let cleared = if settings.cleanup_after_sync && marked > 0 {
            self.store.clear_synced().await?
        } else {
            0
        };
        if cleared > 0 {
            info!("Cleared {} synced records from local storage", cleared);
        }

        info!(
            "Sync complete: {} synced, {} failed",
            result.success_count, result.fail_count
        );
        let _ = self
            .events
            .publish(ScanlogEvent::SyncCompleted {
                succeeded: result.success_count,
                failed: result.fail_count,
                cleared,
            })
            .await;

        Ok(DrainReport {
            trigger,
            online: true,
            skipped: None,
            pending: pending.len(),
            succeeded: result.success_count,
            failed: result.fail_count,
            marked,
            cleared,
            errors: result.errors,
        })
    }

    /// Sleep, drain, heartbeat, repeat. Cancellation is noticed only while
    /// sleeping, so a pass in progress always completes.
    pub async fn run_periodic(&self, token: CancellationToken) {
        let interval = self.settings().interval;
        self.span.in_scope(|| {
            info!(
                "Periodic sync started (mode: {}, interval: {}s, batch size: {}, minimum: {})",
                self.settings().mode,
                interval.as_secs(),
                self.settings().batch_size,
                self.settings().min_records_for_sync
            )
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            self.span.in_scope(|| info!("Running periodic sync"));
            let online = match self.drain(DrainTrigger::Periodic).await {
                Ok(report) => report.online,
                Err(e) => {
                    self.span
                        .in_scope(|| error!("Error in periodic sync: {}", e));
                    // Connectivity was checked before the store failed
                    self.engine.sync_state().is_online
                }
            };
            if online {
                self.engine.heartbeat().await;
            }
        }

        self.span.in_scope(|| info!("Periodic sync stopped"));
    }

    /// One best-effort drain before exit. Never fails.
    pub async fn final_sync(&self) -> Option<DrainReport> {
        self.span.in_scope(|| info!("Performing final sync"));
        match self.drain(DrainTrigger::Shutdown).await {
            Ok(report) => Some(report),
            Err(e) => {
                self.span
                    .in_scope(|| error!("Error during final sync: {}", e));
                None
            }
        }
    }

    pub async fn status(&self) -> Result<ServiceStatus, StoreError> {
        let storage = self.store.stats().await?;
        let state = self.engine.sync_state();

        Ok(ServiceStatus {
            device: self.device.as_ref().clone(),
            backend_online: state.is_online,
            last_backend_check: state.last_check,
            last_sync: *self.last_drain.read(),
            storage,
            sync_config: self.engine.sync_config(),
        })
    }

    /// Remove synced records, serialised with delivery passes
    pub async fn clear_synced(&self) -> Result<usize, StoreError> {
        let _guard = self.drain_lock.lock().await;
        self.store.clear_synced().await
    }

    /// Check connectivity, then upsert the device identity.
    ///
    /// `Ok(false)` means the remote answered but refused.
    pub async fn register_device(&self) -> Result<bool, SyncError> {
        if !self.check_online().await {
            return Err(SyncError::Connectivity {
                details: "backend unreachable".to_string(),
            });
        }
        Ok(self.engine.register_device().await)
    }

    /// Run the connectivity check and announce changes
    async fn check_online(&self) -> bool {
        let before = self.engine.sync_state();
        let online = self.engine.check_connection().await;

        if before.last_check.is_none() || before.is_online != online {
            let _ = self
                .events
                .publish(ScanlogEvent::ConnectivityChanged {
                    online,
                    timestamp: Utc::now(),
                })
                .await;
        }
        online
    }

    async fn cleanup_if_enabled(&self) {
        if !self.settings().cleanup_after_sync {
            return;
        }
        match self.store.clear_synced().await {
            Ok(0) => {}
            Ok(cleared) => info!("Cleared {} synced records from local storage", cleared),
            Err(e) => warn!("Cleanup after immediate sync failed: {}", e),
        }
    }
}
