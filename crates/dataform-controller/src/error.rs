use dataform_core::KeyError;
use dataform_provisioner::ProvisionError;
use dataform_storage::{ErrorCategory, StorageError};
use thiserror::Error;

/// Failure of a single reconcile. Every variant causes a rate-limited retry.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid work item key: {0}")]
    KeyDecode(#[from] KeyError),

    #[error("Failed to read record {key}: {source}")]
    Lookup {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Provisioning {identifier} failed: {source}")]
    Provision {
        identifier: String,
        #[source]
        source: ProvisionError,
    },

    /// The record kept changing underneath the handle write.
    #[error("Record {key} changed while writing instance handle: {source}")]
    WriteConflict {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to write instance handle to {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: StorageError,
    },
}

impl ReconcileError {
    pub fn lookup(key: impl Into<String>, source: StorageError) -> Self {
        Self::Lookup {
            key: key.into(),
            source,
        }
    }

    pub fn provision(identifier: impl Into<String>, source: ProvisionError) -> Self {
        Self::Provision {
            identifier: identifier.into(),
            source,
        }
    }

    /// Maps a failed write, separating version conflicts from other failures.
    pub fn write(key: impl Into<String>, source: StorageError) -> Self {
        let key = key.into();
        if source.is_version_conflict() {
            Self::WriteConflict { key, source }
        } else {
            Self::Write { key, source }
        }
    }

    /// Category used in log fields.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::KeyDecode(_) => ErrorCategory::Validation,
            Self::Lookup { source, .. } | Self::Write { source, .. } => source.category(),
            Self::WriteConflict { .. } => ErrorCategory::Conflict,
            Self::Provision { source, .. } => match source {
                ProvisionError::Internal(_) => ErrorCategory::Internal,
                ProvisionError::Api { .. } | ProvisionError::Throttled { .. } => {
                    ErrorCategory::Infrastructure
                }
            },
        }
    }

    /// Whether a retry can succeed. A malformed key never decodes, but it is
    /// still requeued like every other failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::KeyDecode(_))
    }
}

/// Failure of the controller as a whole.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Timed out after {timeout_ms}ms waiting for the record cache to sync")]
    CacheSyncTimeout { timeout_ms: u64 },

    #[error("Shutdown requested before the record cache synced")]
    ShutdownBeforeSync,

    /// The record source went away before reporting synced.
    #[error("Record watch source closed before the cache synced")]
    WatchClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}
