use super::lock::{FileLock, LockMode};
use crate::error::StoreError;
use crate::record::{AttendanceRecord, RecordKey};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Span};

/// Durable, capacity-bounded, insertion-ordered collection of records.
///
/// Every public call is one persistence transaction: a shared-locked read, or
/// an exclusive-locked read-modify-write of the whole file. Nothing is held
/// between calls, so a caller that reads, decides, and later writes can race
/// another process doing the same. Inside the service all calls go through
/// [`super::StoreHandle`], which makes the service the only writer.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    lock_path: PathBuf,
    max_records: usize,
    span: Span,
}

/// Result of [`RecordStore::add`]
#[derive(Debug, Clone, Default)]
pub struct AddOutcome {
    /// Records held after the add
    pub total: usize,
    /// Oldest records dropped to stay within capacity, oldest first
    pub evicted: Vec<AttendanceRecord>,
}

/// Point-in-time counts
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total_records: usize,
    pub synced_records: usize,
    pub unsynced_records: usize,
    pub max_capacity: usize,
    pub storage_file: String,
}

impl StoreStats {
    pub fn usage_percent(&self) -> f64 {
        if self.max_capacity == 0 {
            return 0.0;
        }
        let percent = 100.0 * self.total_records as f64 / self.max_capacity as f64;
        (percent * 10.0).round() / 10.0
    }
}

struct Loaded {
    records: Vec<AttendanceRecord>,
    corrupt: bool,
}

impl RecordStore {
    /// Open the store at `path`, creating the file and its directory if needed
    pub fn open<P: AsRef<Path>>(path: P, max_records: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let store = Self {
            lock_path: sibling(&path, "lock"),
            path,
            max_records,
            span: Span::none(),
        };

        if !store.path.exists() {
            let _lock = FileLock::acquire(&store.lock_path, LockMode::Exclusive)?;
            if !store.path.exists() {
                store.write_records(&[])?;
                info!("Created record store: {}", store.path.display());
            }
        }

        Ok(store)
    }

    /// Attach the span all store logging happens in
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.max_records
    }

    /// Append a record, then drop the oldest records if over capacity.
    ///
    /// Eviction ignores sync state, so an undelivered record can be lost here.
    pub fn add(&self, mut record: AttendanceRecord) -> Result<AddOutcome, StoreError> {
        let _enter = self.span.enter();
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive)?;
        let loaded = self.load()?;
        self.preserve_if_corrupt(&loaded);
        let mut records = loaded.records;

        record.synced = false;
        records.push(record);

        let mut evicted = Vec::new();
        if records.len() > self.max_records {
            let excess = records.len() - self.max_records;
            evicted = records.drain(..excess).collect();
            for dropped in &evicted {
                if dropped.synced {
                    warn!(
                        "Capacity {} exceeded, evicted synced record {} at {}",
                        self.max_records,
                        dropped.card_id,
                        dropped.timestamp_string()
                    );
                } else {
                    warn!(
                        "Capacity {} exceeded, evicted UNSYNCED record {} at {}; it will never be delivered",
                        self.max_records,
                        dropped.card_id,
                        dropped.timestamp_string()
                    );
                }
            }
        }

        self.write_records(&records)?;
        debug!("Record added to store, total records: {}", records.len());

        Ok(AddOutcome {
            total: records.len(),
            evicted,
        })
    }

    /// Records not yet confirmed by the remote, in arrival order
    pub fn unsynced(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let _enter = self.span.enter();
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Shared)?;
        let unsynced: Vec<_> = self
            .load()?
            .records
            .into_iter()
            .filter(|r| !r.synced)
            .collect();
        debug!("Found {} unsynced records", unsynced.len());
        Ok(unsynced)
    }

    /// Every record, in arrival order
    pub fn all(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let _enter = self.span.enter();
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Shared)?;
        Ok(self.load()?.records)
    }

    /// Mark every record whose key is in `keys` as synced.
    ///
    /// Idempotent. Keys that match nothing (already evicted or cleared) are
    /// ignored. Returns how many records flipped from unsynced to synced.
    pub fn mark_synced(&self, keys: &HashSet<RecordKey>) -> Result<usize, StoreError> {
        let _enter = self.span.enter();
        if keys.is_empty() {
            return Ok(0);
        }

        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive)?;
        let loaded = self.load()?;
        self.preserve_if_corrupt(&loaded);
        let mut records = loaded.records;

        let mut changed = 0;
        for record in records.iter_mut() {
            if !record.synced && keys.contains(&record.timestamp) {
                record.synced = true;
                changed += 1;
            }
        }

        if changed > 0 {
            self.write_records(&records)?;
        }
        info!("Marked {} records as synced", changed);
        Ok(changed)
    }

    /// Remove every synced record; returns how many were removed
    pub fn clear_synced(&self) -> Result<usize, StoreError> {
        let _enter = self.span.enter();
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive)?;
        let loaded = self.load()?;
        self.preserve_if_corrupt(&loaded);

        let before = loaded.records.len();
        let remaining: Vec<_> = loaded.records.into_iter().filter(|r| !r.synced).collect();
        let removed = before - remaining.len();

        if removed > 0 {
            self.write_records(&remaining)?;
        }
        info!("Cleared {} synced records", removed);
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.all()?;
        let synced = records.iter().filter(|r| r.synced).count();

        Ok(StoreStats {
            total_records: records.len(),
            synced_records: synced,
            unsynced_records: records.len() - synced,
            max_capacity: self.max_records,
            storage_file: self.path.display().to_string(),
        })
    }

    /// Read the whole file. An unreadable or malformed file reads as empty.
    fn load(&self) -> Result<Loaded, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Loaded {
                    records: Vec::new(),
                    corrupt: false,
                })
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Loaded {
                records: Vec::new(),
                corrupt: false,
            });
        }

        match serde_json::from_slice::<Vec<AttendanceRecord>>(&raw) {
            Ok(records) => Ok(Loaded {
                records,
                corrupt: false,
            }),
            Err(e) => {
                warn!(
                    "Record store {} is corrupt ({}); treating it as empty, queued backlog is lost",
                    self.path.display(),
                    e
                );
                Ok(Loaded {
                    records: Vec::new(),
                    corrupt: true,
                })
            }
        }
    }

    /// Keep a copy of a corrupt file before it gets overwritten
    fn preserve_if_corrupt(&self, loaded: &Loaded) {
        if !loaded.corrupt {
            return;
        }
        let backup = sibling(&self.path, "corrupt");
        match fs::copy(&self.path, &backup) {
            Ok(_) => warn!("Copied corrupt record store to {}", backup.display()),
            Err(e) => warn!("Failed to copy corrupt record store aside: {}", e),
        }
    }

    /// Replace the file contents atomically
    fn write_records(&self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp_path = sibling(&self.path, "tmp");

        let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(&data)
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

/// `records.json` -> `records.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
