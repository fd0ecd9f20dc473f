use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Component lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Why the service is stopping
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    Signal(String),
    Error(String),
    /// Published on the event bus, e.g. card input closed
    Requested(String),
}

/// Component name to state, shared with the dashboard
pub type ComponentStates = Arc<Mutex<HashMap<String, ComponentState>>>;
