use super::{ScanlogApp, ShutdownReason};
use crate::error::{Result, ScanlogError};
use crate::events::ScanlogEvent;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{error, info, warn};

type SharedSender = Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>;

impl ScanlogApp {
    /// Wait for a signal or a shutdown request, then shut down gracefully
    pub async fn run(&mut self) -> Result<i32> {
        info!("Scanlog is running");

        let shutdown_sender = self
            .shutdown_sender
            .take()
            .ok_or_else(|| ScanlogError::system("Shutdown sender already taken"))?;

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| ScanlogError::system("Shutdown receiver already taken"))?;

        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));
        self.setup_signal_handlers(Arc::clone(&shutdown_sender));

        let events = self
            .shutdown_events
            .take()
            .unwrap_or_else(|| self.event_bus.subscribe());
        spawn_request_listener(events, shutdown_sender);

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| ScanlogError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;

        info!("Scanlog shutdown complete");
        Ok(exit_code)
    }

    fn setup_signal_handlers(&self, shutdown_sender: SharedSender) {
        // SIGTERM (systemd stop)
        #[cfg(unix)]
        {
            let sender = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(e) => {
                            error!("Failed to register SIGTERM handler: {}", e);
                            return;
                        }
                    };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    send_reason(&sender, ShutdownReason::Signal("SIGTERM".to_string())).await;
                }
            });
        }

        // SIGINT (Ctrl+C)
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                send_reason(
                    &shutdown_sender,
                    ShutdownReason::Signal("SIGINT".to_string()),
                )
                .await;
            }
        });
    }
}

/// Turn a `ShutdownRequested` event into a shutdown
fn spawn_request_listener(mut events: broadcast::Receiver<ScanlogEvent>, sender: SharedSender) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ScanlogEvent::ShutdownRequested { reason, .. }) => {
                    send_reason(&sender, ShutdownReason::Requested(reason)).await;
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Shutdown listener skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn send_reason(sender: &SharedSender, reason: ShutdownReason) {
    if let Some(sender) = sender.lock().await.take() {
        let _ = sender.send(reason);
    }
}
