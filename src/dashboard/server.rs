use crate::app::ComponentStates;
use crate::config::ScanlogConfig;
use crate::error::DashboardError;
use crate::orchestrator::Orchestrator;
use axum::{
    routing::{get, post},
    Router,
};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers::{
    clear_storage_handler, config_handler, device_info_handler, events_handler, export_handler,
    health_handler, records_handler, records_stats_handler, register_device_handler,
    status_handler, sync_config_handler, trigger_sync_handler, unsynced_records_handler,
};

/// Shared state for the dashboard routes
#[derive(Clone)]
pub struct DashboardState {
    pub(crate) orchestrator: Orchestrator,
    pub(crate) component_states: ComponentStates,
    /// Served as-is, so the API key is already masked
    pub(crate) config: Arc<ScanlogConfig>,
    pub(crate) timezone: Tz,
    /// Ends open event streams so graceful shutdown can complete
    pub(crate) shutdown: CancellationToken,
}

impl DashboardState {
    pub fn new(
        config: &ScanlogConfig,
        orchestrator: Orchestrator,
        component_states: ComponentStates,
    ) -> Self {
        Self {
            timezone: orchestrator.timezone(),
            orchestrator,
            component_states,
            config: Arc::new(config.redacted()),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the dashboard router over `state`
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/records", get(records_handler))
        .route("/api/records/unsynced", get(unsynced_records_handler))
        .route("/api/records/stats", get(records_stats_handler))
        .route("/api/sync/trigger", post(trigger_sync_handler))
        .route("/api/sync/config", get(sync_config_handler))
        .route("/api/storage/clear", post(clear_storage_handler))
        .route("/api/device/register", post(register_device_handler))
        .route("/api/device", get(device_info_handler))
        .route("/api/export/records", get(export_handler))
        .route("/api/config", get(config_handler))
        .route("/api/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Dashboard HTTP server
pub struct DashboardServer {
    address: String,
    state: DashboardState,
}

impl DashboardServer {
    pub fn new(
        config: &ScanlogConfig,
        orchestrator: Orchestrator,
        component_states: ComponentStates,
    ) -> Self {
        Self {
            address: format!("{}:{}", config.dashboard.ip, config.dashboard.port),
            state: DashboardState::new(config, orchestrator, component_states),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Bind the listening socket so address errors surface during startup
    pub async fn bind(&self) -> Result<TcpListener, DashboardError> {
        info!("Starting dashboard on {}", self.address);

        TcpListener::bind(&self.address)
            .await
            .map_err(|e| DashboardError::BindFailed {
                address: self.address.clone(),
                source: e,
            })
    }

    /// Serve until `token` is cancelled
    pub async fn serve(
        self,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), DashboardError> {
        let state = DashboardState {
            shutdown: token.clone(),
            ..self.state
        };

        info!("Dashboard listening on {}", self.address);

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .map_err(|e| DashboardError::ServerFailed {
                details: format!("Server error: {}", e),
            })?;

        info!("Dashboard stopped");
        Ok(())
    }
}
