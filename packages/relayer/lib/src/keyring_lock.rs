//! Host-wide serialization of keyring access.
//!
//! Signing a Cosmos SDK transaction reads and bumps the account sequence, so two concurrent
//! signers using the same key produce sequence mismatches. Several relayer processes may share
//! one keyring directory, so an in-memory mutex is not enough: the lock is an advisory file lock
//! on `<keyring dir>/keys.lock`, taken after an in-process queue.

use std::{
    fs::{File, OpenOptions},
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use fs2::FileExt;
use tokio::sync::Mutex;

use crate::error::LockError;

/// Name of the lock file inside the keyring directory.
pub const KEYRING_LOCK_FILE: &str = "keys.lock";

/// Exclusive, cross-process lock guarding every operation that signs with the keyring.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct KeyringLock {
    path: PathBuf,
    local: Arc<Mutex<()>>,
}

impl KeyringLock {
    /// Create a lock for the keyring at `keyring_dir`.
    #[must_use]
    pub fn new(keyring_dir: impl AsRef<Path>) -> Self {
        Self {
            path: keyring_dir.as_ref().join(KEYRING_LOCK_FILE),
            local: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` while holding the lock.
    ///
    /// The lock is released on every exit path: after `f` completes, when `f` panics and when
    /// the returned future is dropped.
    ///
    /// # Errors
    /// Returns an error if the lock cannot be acquired or released. `f` is not run if the
    /// lock cannot be acquired.
    pub async fn with_lock<T, F, Fut>(&self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let _local = self.local.lock().await;

        let path = self.path.clone();
        let guard = tokio::task::spawn_blocking(move || FileLockGuard::acquire(path)).await??;
        tracing::trace!(path = %self.path.display(), "Acquired keyring lock");

        let output = f().await;

        guard.release()?;
        tracing::trace!(path = %self.path.display(), "Released keyring lock");
        Ok(output)
    }
}

struct FileLockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl FileLockGuard {
    fn acquire(path: PathBuf) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        FileExt::lock_exclusive(&file).map_err(|source| LockError::Acquire {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    fn release(mut self) -> Result<(), LockError> {
        match self.file.take() {
            Some(file) => FileExt::unlock(&file).map_err(|source| LockError::Release {
                path: self.path.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = FileExt::unlock(&file) {
                tracing::error!(path = %self.path.display(), error = %err, "Failed to release keyring lock");
            }
        }
    }
}
