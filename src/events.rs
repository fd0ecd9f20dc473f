use crate::error::EventBusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Notifications emitted while records move through the system.
///
/// These are advisory; the record file stays the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanlogEvent {
    /// A scan was durably written to the store
    RecordStored {
        card_id: String,
        timestamp: DateTime<Utc>,
        total_records: usize,
    },
    /// Capacity overflow dropped the oldest record
    RecordEvicted {
        card_id: String,
        timestamp: DateTime<Utc>,
        was_synced: bool,
    },
    /// Records were confirmed by the remote and marked synced
    RecordsSynced { count: usize },
    /// A drain pass finished (possibly with nothing to do)
    SyncCompleted {
        succeeded: usize,
        failed: usize,
        cleared: usize,
    },
    /// The connectivity check result differs from the previous one
    ConnectivityChanged {
        online: bool,
        timestamp: DateTime<Utc>,
    },
    /// Something asked the service to stop
    ShutdownRequested {
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

impl ScanlogEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ScanlogEvent::RecordStored {
                card_id,
                total_records,
                ..
            } => format!("Card {} stored ({} records held)", card_id, total_records),
            ScanlogEvent::RecordEvicted {
                card_id, was_synced, ..
            } => format!(
                "Card {} evicted ({})",
                card_id,
                if *was_synced { "synced" } else { "never delivered" }
            ),
            ScanlogEvent::RecordsSynced { count } => format!("{} records marked synced", count),
            ScanlogEvent::SyncCompleted {
                succeeded,
                failed,
                cleared,
            } => format!(
                "Sync completed: {} succeeded, {} failed, {} cleared",
                succeeded, failed, cleared
            ),
            ScanlogEvent::ConnectivityChanged { online, .. } => {
                format!("Backend {}", if *online { "online" } else { "offline" })
            }
            ScanlogEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanlogEvent::RecordStored { .. } => "record_stored",
            ScanlogEvent::RecordEvicted { .. } => "record_evicted",
            ScanlogEvent::RecordsSynced { .. } => "records_synced",
            ScanlogEvent::SyncCompleted { .. } => "sync_completed",
            ScanlogEvent::ConnectivityChanged { .. } => "connectivity_changed",
            ScanlogEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<ScanlogEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ScanlogEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub async fn publish(&self, event: ScanlogEvent) -> Result<usize, EventBusError> {
        match &event {
            ScanlogEvent::ConnectivityChanged { online, .. } => {
                if *online {
                    info!("Backend connectivity restored");
                } else {
                    warn!("Backend connectivity lost");
                }
            }
            ScanlogEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => debug!("Event: {}", event.description()),
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
