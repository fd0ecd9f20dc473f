pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod orchestrator;
pub mod reader;
pub mod record;
pub mod store;
pub mod sync;

#[cfg(feature = "dashboard")]
pub mod dashboard;

pub use app::{ComponentState, ScanlogApp, ShutdownReason};
pub use config::{ScanlogConfig, SyncMode, SyncSettings};
pub use error::{Result, ScanlogError, StoreError, SyncError};
pub use events::{EventBus, ScanlogEvent};
pub use orchestrator::{DrainReport, DrainTrigger, Orchestrator, ServiceStatus, SkipReason};
pub use reader::CardReader;
pub use record::{AttendanceRecord, RecordKey};
pub use store::{RecordStore, StoreHandle, StoreStats};
pub use sync::{BatchResult, HttpTransport, SyncEngine, Transport};

#[cfg(feature = "dashboard")]
pub use dashboard::DashboardServer;
