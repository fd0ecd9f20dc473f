//! Durable local queue of attendance records.
//!
//! [`RecordStore`] is the file-backed collection; [`StoreHandle`] is the
//! single-writer front the running service uses.

mod actor;
mod file;
mod lock;

pub use actor::{StoreHandle, StoreWorker};
pub use file::{AddOutcome, RecordStore, StoreStats};
