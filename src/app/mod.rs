//! Process lifecycle of the edge service.

mod runtime;
mod service;
mod shutdown;
mod startup;
mod types;

#[cfg(test)]
mod tests;

pub use service::ScanlogApp;
pub use types::{ComponentState, ComponentStates, ShutdownReason};
