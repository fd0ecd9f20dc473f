use super::service::{DASHBOARD, IMMEDIATE_SYNC, INGEST, PERIODIC_SYNC, READER, STORE};
use super::{ComponentState, ScanlogApp};
use crate::error::{Result, ScanlogError};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

const STORE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

impl ScanlogApp {
    /// Stop everything in reverse start order, run the final sync, and
    /// return the process exit code
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        let mut exit_code = 0;

        if self.reader_enabled {
            self.set_component_state(READER, ComponentState::Stopping)
                .await;
            self.reader.stop();
            self.set_component_state(READER, ComponentState::Stopped)
                .await;
        }
        self.scan_sender = None;

        // Loops notice this at their next wait point
        self.cancellation_token.cancel();

        for name in [DASHBOARD, PERIODIC_SYNC, IMMEDIATE_SYNC, INGEST] {
            if let Err(e) = self.stop_task(name).await {
                error!("Error stopping {}: {}", name, e);
                exit_code = 1;
            }
        }

        if let Some(report) = self.orchestrator.final_sync().await {
            info!(
                "Final sync: {} synced, {} failed, {} cleared",
                report.succeeded, report.failed, report.cleared
            );
        }

        if let Err(e) = self.stop_store().await {
            error!("Error stopping store: {}", e);
            exit_code = 1;
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// A pass already in flight may take up to two batch timeouts per chunk
    fn task_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.timeout_seconds * 2 + 5)
    }

    async fn stop_task(&mut self, name: &'static str) -> Result<()> {
        let Some(index) = self.tasks.iter().position(|(task, _)| *task == name) else {
            return Ok(());
        };
        let (_, handle) = self.tasks.remove(index);

        info!("Stopping {} component", name);
        self.set_component_state(name, ComponentState::Stopping)
            .await;

        match timeout(self.task_stop_timeout(), handle).await {
            Ok(Ok(())) => {
                self.set_component_state(name, ComponentState::Stopped)
                    .await;
                info!("{} component stopped", name);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_component_state(name, ComponentState::Failed)
                    .await;
                Err(ScanlogError::component(name.to_string(), e.to_string()))
            }
            Err(_) => {
                self.set_component_state(name, ComponentState::Failed)
                    .await;
                Err(ScanlogError::component(
                    name.to_string(),
                    "stop timeout".to_string(),
                ))
            }
        }
    }

    async fn stop_store(&mut self) -> Result<()> {
        self.set_component_state(STORE, ComponentState::Stopping)
            .await;
        self.store.shutdown().await;

        if let Some(worker) = self.store_worker.take() {
            if timeout(STORE_STOP_TIMEOUT, worker.join()).await.is_err() {
                self.set_component_state(STORE, ComponentState::Failed)
                    .await;
                return Err(ScanlogError::component(
                    STORE.to_string(),
                    "stop timeout".to_string(),
                ));
            }
        }

        self.set_component_state(STORE, ComponentState::Stopped)
            .await;
        Ok(())
    }
}
