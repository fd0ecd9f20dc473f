use super::types::{ComponentState, ComponentStates, ShutdownReason};
use crate::config::ScanlogConfig;
use crate::error::Result;
use crate::events::{EventBus, ScanlogEvent};
use crate::orchestrator::Orchestrator;
use crate::reader::CardReader;
use crate::record::AttendanceRecord;
use crate::store::{RecordStore, StoreHandle, StoreWorker};
use crate::sync::SyncEngine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};

pub(super) const STORE: &str = "store";
pub(super) const READER: &str = "reader";
pub(super) const INGEST: &str = "ingest";
pub(super) const IMMEDIATE_SYNC: &str = "immediate_sync";
pub(super) const PERIODIC_SYNC: &str = "periodic_sync";
pub(super) const DASHBOARD: &str = "dashboard";

/// The edge service: owns every component and drives its lifecycle
pub struct ScanlogApp {
    pub(super) config: ScanlogConfig,
    pub(super) event_bus: Arc<EventBus>,
    pub(super) store: StoreHandle,
    pub(super) store_worker: Option<StoreWorker>,
    pub(super) orchestrator: Orchestrator,
    pub(super) reader: CardReader,
    pub(super) reader_enabled: bool,
    pub(super) scan_sender: Option<mpsc::Sender<AttendanceRecord>>,

    // Lifecycle management
    pub(super) tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub(super) component_states: ComponentStates,
    pub(super) shutdown_events: Option<broadcast::Receiver<ScanlogEvent>>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl ScanlogApp {
    /// Build the service talking HTTP to the configured server
    pub async fn new(config: ScanlogConfig) -> Result<Self> {
        let engine = SyncEngine::from_config(&config)?;
        Self::with_engine(config, engine).await
    }

    /// Build the service around an existing sync engine
    pub async fn with_engine(config: ScanlogConfig, engine: SyncEngine) -> Result<Self> {
        let device_id = config.device.id.as_str();
        let timezone = config.timezone()?;
        let event_bus = Arc::new(EventBus::default());

        let store = RecordStore::open(&config.storage.path, config.storage.max_records)?
            .with_span(info_span!("store", device = %device_id));
        let (store, store_worker) = StoreHandle::spawn(store)?;

        let engine = engine.with_span(info_span!("sync_engine", device = %device_id));
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(engine),
            Arc::clone(&event_bus),
            config.device.clone(),
        )
        .with_timezone(timezone)
        .with_span(info_span!("orchestrator", device = %device_id));

        let reader = CardReader::new(&config, Arc::clone(&event_bus))
            .with_span(info_span!("reader", device = %device_id));
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Ok(Self {
            config,
            event_bus,
            store,
            store_worker: Some(store_worker),
            orchestrator,
            reader,
            reader_enabled: true,
            scan_sender: None,
            tasks: Vec::new(),
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_events: None,
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Enable or disable the card reader (disabled when scans come from
    /// elsewhere, e.g. tests)
    pub fn set_reader_enabled(&mut self, enabled: bool) {
        self.reader_enabled = enabled;
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Channel scans enter the service through, once started
    pub fn scan_sender(&self) -> Option<mpsc::Sender<AttendanceRecord>> {
        self.scan_sender.clone()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Shared handle to the component state map
    pub fn component_states(&self) -> ComponentStates {
        Arc::clone(&self.component_states)
    }

    pub async fn set_component_state(&self, component: &str, state: ComponentState) {
        debug!("Component '{}' state changed to: {:?}", component, state);
        self.component_states
            .lock()
            .await
            .insert(component.to_string(), state);
    }

    pub async fn component_state(&self, component: &str) -> Option<ComponentState> {
        self.component_states.lock().await.get(component).cloned()
    }

    pub(super) fn dashboard_enabled(&self) -> bool {
        cfg!(feature = "dashboard") && self.config.dashboard.enabled
    }
}
