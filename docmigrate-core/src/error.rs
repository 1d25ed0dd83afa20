//! Engine error type.

use thiserror::Error;

use crate::provider::StorageError;

/// Errors raised by the migration engine.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Bad job parameters; the job is never created.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unknown or inactive provider name.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Destination provider refuses writes.
    #[error("Provider is not writable: {0}")]
    ProviderUnwritable(String),

    /// No job with the given id.
    #[error("Migration job not found: {0}")]
    JobNotFound(String),

    /// Lifecycle call not allowed from the job's current status.
    #[error("Invalid job transition: {0}")]
    InvalidTransition(String),

    /// Transient I/O failure against a storage adapter.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Destination read-back does not match the source digest.
    #[error("Content mismatch: expected {expected}, found {actual}")]
    ContentMismatch {
        /// Source digest.
        expected: String,
        /// Digest read back from the destination.
        actual: String,
    },

    /// A claim was reaped or finished by someone else. Expected under
    /// concurrency and never surfaced to callers.
    #[error("Claim conflict: {0}")]
    ClaimConflict(String),

    /// Job counters disagree with item rows.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Store backend failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Work abandoned because of shutdown or job cancellation.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Bug or unexpected state.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// Errors that count against an item's attempt budget rather than
    /// aborting the worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::Transfer(_)
                | MigrationError::ContentMismatch { .. }
                | MigrationError::ProviderNotFound(_)
        )
    }

    /// Errors raised while validating a request, before anything is written.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MigrationError::InvalidConfiguration(_)
                | MigrationError::ProviderNotFound(_)
                | MigrationError::ProviderUnwritable(_)
        )
    }
}

impl From<StorageError> for MigrationError {
    fn from(err: StorageError) -> Self {
        MigrationError::Transfer(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::migrate::MigrateError> for MigrationError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        MigrationError::Database(format!("schema migration failed: {err}"))
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, MigrationError>;
