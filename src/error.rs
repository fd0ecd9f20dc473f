use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanlogError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Dashboard error: {0}")]
    Dashboard(#[from] DashboardError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl ScanlogError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Failures of the durable record store. A caller receiving any of these must
/// not assume the record was saved.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode records: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to lock store file {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store writer is no longer running")]
    ActorClosed,
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Remote delivery failures. None of these are fatal: the affected records stay
/// unsynced and are retried on the next pass.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Remote unreachable: {details}")]
    Connectivity { details: String },

    #[error("Remote rejected request with status {status}: {message}")]
    RemoteRejection { status: u16, message: String },

    #[error("HTTP client error: {details}")]
    Client { details: String },
}

impl SyncError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity { .. })
    }
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },
}

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("Failed to bind dashboard to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Dashboard server failed: {details}")]
    ServerFailed { details: String },
}

pub type Result<T> = std::result::Result<T, ScanlogError>;
