//! Durable mapping from a path name to the id of the light client created for it.
//!
//! The database is opened and closed around every call so that several relayer processes can
//! share it. `sled` holds an exclusive file lock while open, hence the in-process mutex and the
//! short, bounded retry when another process has the database open.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::Mutex;

use crate::error::StoreError;

const OPEN_ATTEMPTS: u32 = 20;
const OPEN_BACKOFF: Duration = Duration::from_millis(50);

/// `sled` backed store of client ids.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct ClientIdStore {
    path: PathBuf,
    access: Arc<Mutex<()>>,
}

impl ClientIdStore {
    /// Create a store backed by the database at `path`. Nothing is opened until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            access: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the client id stored under `key`. A missing key is not an error.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or read, or holds a non utf-8 value.
    #[tracing::instrument(skip(self), fields(db = %self.path.display()))]
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _access = self.access.lock().await;
        let path = self.path.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let db = open(&path)?;
            let value = db.get(key.as_bytes())?;
            drop(db);

            value
                .map(|bytes| {
                    String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::InvalidValue { key })
                })
                .transpose()
        })
        .await?
    }

    /// Store `client_id` under `key`, overwriting any previous value.
    ///
    /// The write is flushed to disk before returning.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened, written or flushed.
    #[tracing::instrument(skip(self), fields(db = %self.path.display()))]
    pub async fn set(&self, key: &str, client_id: &str) -> Result<(), StoreError> {
        let _access = self.access.lock().await;
        let path = self.path.clone();
        let key = key.to_string();
        let value = client_id.to_string();

        tokio::task::spawn_blocking(move || {
            let db = open(&path)?;
            db.insert(key.as_bytes(), value.as_bytes())?;
            db.flush()?;
            drop(db);

            tracing::debug!(key, client_id = value, "Stored client id");
            Ok(())
        })
        .await?
    }
}

fn open(path: &Path) -> Result<sled::Db, StoreError> {
    let config = sled::Config::new().path(path).flush_every_ms(None);

    let mut attempt = 1;
    loop {
        match config.open() {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(err)) if attempt < OPEN_ATTEMPTS => {
                tracing::debug!(attempt, error = %err, "Client id store is busy, retrying");
                attempt += 1;
                std::thread::sleep(OPEN_BACKOFF);
            }
            Err(source) => {
                return Err(StoreError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}
