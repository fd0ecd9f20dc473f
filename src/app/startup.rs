use super::service::{DASHBOARD, IMMEDIATE_SYNC, INGEST, PERIODIC_SYNC, READER, STORE};
use super::{ComponentState, ScanlogApp};
use crate::config::SyncMode;
use crate::error::Result;
use crate::record::AttendanceRecord;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const INGEST_QUEUE: usize = 1024;

impl ScanlogApp {
    /// Register every component in the state map
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing scanlog components");

        let mut states = self.component_states.lock().await;
        states.insert(STORE.to_string(), ComponentState::Running);
        states.insert(INGEST.to_string(), ComponentState::Stopped);
        states.insert(PERIODIC_SYNC.to_string(), ComponentState::Stopped);

        if self.config.sync.mode == SyncMode::Immediate {
            states.insert(IMMEDIATE_SYNC.to_string(), ComponentState::Stopped);
        }
        if self.reader_enabled {
            states.insert(READER.to_string(), ComponentState::Stopped);
        }
        if self.dashboard_enabled() {
            states.insert(DASHBOARD.to_string(), ComponentState::Stopped);
        }
        drop(states);

        info!("All components initialized successfully");
        Ok(())
    }

    /// Check the backend, then start the loops, the reader and the dashboard
    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Starting scanlog on device {} ({}) at {}",
            self.config.device.id, self.config.device.name, self.config.device.location
        );

        match self.orchestrator.register_device().await {
            Ok(true) => info!("Backend connection established, device registered"),
            Ok(false) => warn!("Backend reachable but device registration failed"),
            Err(_) => warn!("Backend unreachable, operating in offline mode"),
        }

        let stats = self.store.stats().await?;
        info!(
            "Storage status: {} total, {} synced, {} pending (capacity {})",
            stats.total_records, stats.synced_records, stats.unsynced_records, stats.max_capacity
        );

        // Subscribe before anything can publish a shutdown request
        self.shutdown_events = Some(self.event_bus.subscribe());

        let (scan_sender, scan_receiver) = mpsc::channel(INGEST_QUEUE);
        self.scan_sender = Some(scan_sender.clone());
        self.spawn_ingest_loop(scan_receiver).await;

        if self.config.sync.mode == SyncMode::Immediate {
            let orchestrator = self.orchestrator.clone();
            let token = self.cancellation_token.clone();
            self.tasks.push((
                IMMEDIATE_SYNC,
                tokio::spawn(async move { orchestrator.run_immediate_worker(token).await }),
            ));
            self.set_component_state(IMMEDIATE_SYNC, ComponentState::Running)
                .await;
        }

        let orchestrator = self.orchestrator.clone();
        let token = self.cancellation_token.clone();
        self.tasks.push((
            PERIODIC_SYNC,
            tokio::spawn(async move { orchestrator.run_periodic(token).await }),
        ));
        self.set_component_state(PERIODIC_SYNC, ComponentState::Running)
            .await;

        if self.dashboard_enabled() {
            self.start_dashboard().await?;
        }

        if self.reader_enabled {
            self.set_component_state(READER, ComponentState::Starting)
                .await;
            if let Err(e) = self.reader.start(scan_sender) {
                error!("Failed to start card reader: {}", e);
                self.set_component_state(READER, ComponentState::Failed)
                    .await;
                return Err(e);
            }
            self.set_component_state(READER, ComponentState::Running)
                .await;
        }

        info!(
            "Scanlog started (mode: {}, interval: {}s, batch size: {})",
            self.config.sync.mode, self.config.sync.interval_seconds, self.config.sync.batch_size
        );
        Ok(())
    }

    /// Feed scans into the orchestrator. On cancellation, scans already
    /// queued are still stored before the loop exits.
    async fn spawn_ingest_loop(&mut self, mut scans: mpsc::Receiver<AttendanceRecord>) {
        let orchestrator = self.orchestrator.clone();
        let token = self.cancellation_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = token.cancelled() => break,
                    next = scans.recv() => match next {
                        Some(record) => record,
                        None => return,
                    },
                };
                if let Err(e) = orchestrator.ingest(record).await {
                    error!("Failed to store scan: {}", e);
                }
            }

            scans.close();
            while let Some(record) = scans.recv().await {
                if let Err(e) = orchestrator.ingest(record).await {
                    error!("Failed to store scan during shutdown: {}", e);
                }
            }
        });

        self.tasks.push((INGEST, handle));
        self.set_component_state(INGEST, ComponentState::Running)
            .await;
    }

    #[cfg(feature = "dashboard")]
    async fn start_dashboard(&mut self) -> Result<()> {
        use crate::dashboard::DashboardServer;
        use tracing::{info_span, Instrument};

        self.set_component_state(DASHBOARD, ComponentState::Starting)
            .await;

        let server = DashboardServer::new(
            &self.config,
            self.orchestrator.clone(),
            self.component_states(),
        );
        let listener = match server.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_component_state(DASHBOARD, ComponentState::Failed)
                    .await;
                return Err(e.into());
            }
        };

        let token = self.cancellation_token.clone();
        let span = info_span!("dashboard", device = %self.config.device.id);
        self.tasks.push((
            DASHBOARD,
            tokio::spawn(
                async move {
                    if let Err(e) = server.serve(listener, token).await {
                        error!("Dashboard error: {}", e);
                    }
                }
                .instrument(span),
            ),
        ));
        self.set_component_state(DASHBOARD, ComponentState::Running)
            .await;
        Ok(())
    }

    #[cfg(not(feature = "dashboard"))]
    async fn start_dashboard(&mut self) -> Result<()> {
        Ok(())
    }
}
