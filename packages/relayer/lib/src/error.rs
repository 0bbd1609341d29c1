//! Error types returned by the relayer components.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by bootstrap, update and scheduling of a chain pair.
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum RelayerError {
    /// A remote query or submission kept failing until the retry budget was spent.
    #[error("{operation} failed after {attempts} attempt(s): {cause:#}")]
    Network {
        /// What was being attempted.
        operation: String,
        /// How many attempts were made.
        attempts: u32,
        /// The error returned by the last attempt.
        cause: anyhow::Error,
    },
    /// The client id store could not be read or written.
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// The keyring lock could not be acquired or released.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// The pair is misconfigured and cannot be relayed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The transaction was broadcast but its inclusion could not be confirmed.
    #[error("tx {tx_hash} was broadcast but not confirmed: {reason}")]
    PartialSend {
        /// Hash of the broadcast transaction.
        tx_hash: String,
        /// Why inclusion could not be confirmed.
        reason: String,
    },
    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl RelayerError {
    /// Whether the error must stop the update loop of the affected pair.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Configuration(_))
    }

    /// Wraps a single failed provider call that is not retried.
    pub fn network(operation: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            attempts: 1,
            cause,
        }
    }
}

/// Errors returned by [`crate::client_id_store::ClientIdStore`].
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum StoreError {
    /// The database could not be opened.
    #[error("failed to open client id store at {}: {source}", path.display())]
    Open {
        /// Location of the database.
        path: PathBuf,
        /// Underlying storage error.
        #[source]
        source: sled::Error,
    },
    /// A read, write or flush failed.
    #[error("client id store i/o failed: {0}")]
    Db(#[from] sled::Error),
    /// The stored value is not a valid client id.
    #[error("value stored under {key:?} is not valid utf-8")]
    InvalidValue {
        /// The key whose value is corrupted.
        key: String,
    },
    /// The blocking storage task did not complete.
    #[error("client id store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors returned by [`crate::keyring_lock::KeyringLock`].
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum LockError {
    /// The lock file could not be created or opened.
    #[error("failed to open keyring lock file {}: {source}", path.display())]
    Open {
        /// Location of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The exclusive lock could not be acquired.
    #[error("failed to acquire keyring lock {}: {source}", path.display())]
    Acquire {
        /// Location of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The lock could not be released; the file may need manual removal.
    #[error("failed to release keyring lock {}, please remove it manually: {source}", path.display())]
    Release {
        /// Location of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The blocking lock task did not complete.
    #[error("keyring lock task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_and_configuration_errors_are_fatal() {
        assert!(RelayerError::Configuration("missing key".to_string()).is_fatal());
        assert!(RelayerError::Storage(StoreError::InvalidValue {
            key: "path".to_string()
        })
        .is_fatal());

        assert!(!RelayerError::network("query", anyhow::anyhow!("timeout")).is_fatal());
        assert!(!RelayerError::Cancelled.is_fatal());
        assert!(!RelayerError::PartialSend {
            tx_hash: "AB".to_string(),
            reason: "not found".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn network_error_reports_attempts_and_last_cause() {
        let err = RelayerError::Network {
            operation: "query latest heights".to_string(),
            attempts: 3,
            cause: anyhow::anyhow!("connection refused"),
        };

        assert_eq!(
            err.to_string(),
            "query latest heights failed after 3 attempt(s): connection refused"
        );
    }
}
