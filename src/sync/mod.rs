//! Delivery of queued records to the remote attendance API.

mod engine;
pub mod mock;
mod transport;
pub mod wire;

pub use engine::{BatchResult, RecordError, SyncConfigView, SyncEngine, SyncState};
pub use mock::ScriptedTransport;
pub use transport::{HttpTransport, RemoteResponse, Transport};

#[cfg(test)]
mod tests;
