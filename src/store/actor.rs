use super::file::{AddOutcome, RecordStore, StoreStats};
use crate::error::StoreError;
use crate::record::{AttendanceRecord, RecordKey};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum StoreCommand {
    Add(AttendanceRecord, Reply<AddOutcome>),
    Unsynced(Reply<Vec<AttendanceRecord>>),
    All(Reply<Vec<AttendanceRecord>>),
    MarkSynced(HashSet<RecordKey>, Reply<usize>),
    ClearSynced(Reply<usize>),
    Stats(Reply<StoreStats>),
    Shutdown,
}

/// Cloneable front for the single thread that owns the [`RecordStore`].
///
/// Commands are served strictly in arrival order, so inside the process every
/// read-modify-write sequence is serialised. Once the owner stops, every call
/// fails with [`StoreError::ActorClosed`].
#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreCommand>,
    capacity: usize,
}

/// Join handle for the owning thread
pub struct StoreWorker {
    handle: JoinHandle<()>,
}

impl StoreWorker {
    /// Wait until the owning thread has drained its queue and exited
    pub async fn join(self) {
        let handle = self.handle;
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Store writer panicked"),
            Err(e) => error!("Failed to wait for store writer: {}", e),
        }
    }
}

impl StoreHandle {
    /// Move `store` onto its own named thread and return a handle to it
    pub fn spawn(store: RecordStore) -> Result<(Self, StoreWorker), StoreError> {
        let (sender, mut receiver) = mpsc::channel(COMMAND_BUFFER);
        let capacity = store.capacity();
        let path = store.path().to_path_buf();

        let spawned = std::thread::Builder::new()
            .name("store-writer".to_string())
            .spawn(move || {
                info!("Store writer started for {}", store.path().display());
                while let Some(command) = receiver.blocking_recv() {
                    match command {
                        StoreCommand::Add(record, reply) => {
                            let _ = reply.send(store.add(record));
                        }
                        StoreCommand::Unsynced(reply) => {
                            let _ = reply.send(store.unsynced());
                        }
                        StoreCommand::All(reply) => {
                            let _ = reply.send(store.all());
                        }
                        StoreCommand::MarkSynced(keys, reply) => {
                            let _ = reply.send(store.mark_synced(&keys));
                        }
                        StoreCommand::ClearSynced(reply) => {
                            let _ = reply.send(store.clear_synced());
                        }
                        StoreCommand::Stats(reply) => {
                            let _ = reply.send(store.stats());
                        }
                        StoreCommand::Shutdown => {
                            debug!("Store writer received shutdown");
                            break;
                        }
                    }
                }
                info!("Store writer stopped");
            });
        let handle = spawned.map_err(|source| StoreError::io(&path, source))?;

        Ok((Self { sender, capacity }, StoreWorker { handle }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn add(&self, record: AttendanceRecord) -> Result<AddOutcome, StoreError> {
        self.request(|reply| StoreCommand::Add(record, reply)).await
    }

    pub async fn unsynced(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.request(StoreCommand::Unsynced).await
    }

    pub async fn all(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.request(StoreCommand::All).await
    }

    pub async fn mark_synced(&self, keys: HashSet<RecordKey>) -> Result<usize, StoreError> {
        self.request(|reply| StoreCommand::MarkSynced(keys, reply))
            .await
    }

    pub async fn clear_synced(&self) -> Result<usize, StoreError> {
        self.request(StoreCommand::ClearSynced).await
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.request(StoreCommand::Stats).await
    }

    /// Ask the owner to stop after the commands already queued
    pub async fn shutdown(&self) {
        let _ = self.sender.send(StoreCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, StoreError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| StoreError::ActorClosed)?;
        response.await.map_err(|_| StoreError::ActorClosed)?
    }
}
