use crate::error::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Advisory lock on a sibling `.lock` file, held for the duration of one store
/// call. Dropping the guard releases it.
pub(crate) struct FileLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path, mode: LockMode) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| StoreError::Lock {
                path: path.to_path_buf(),
                source,
            })?;

        lock(&file, mode).map_err(|source| StoreError::Lock {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock(file: &File, mode: LockMode) -> std::io::Result<()> {
    match mode {
        LockMode::Shared => FileExt::lock_shared(file),
        LockMode::Exclusive => FileExt::lock_exclusive(file),
    }
}
