//! Storage provider contract consumed by the migration engine.
//!
//! Every backend (filesystem workspace, object storage, hosted document
//! service) exposes the same capability set through [`StorageAdapter`]. The
//! engine selects adapters by registry lookup and never depends on a concrete
//! backend type.

pub mod local;
pub mod memory;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::digest::ContentDigest;
use crate::error::MigrationError;
use crate::types::ids::ProviderId;

pub use local::LocalWorkspaceAdapter;
pub use memory::InMemoryAdapter;
pub use registry::{AdapterFactory, BuiltinAdapterFactory, ProviderRegistry};

/// Failures reported by storage adapters.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document id {id:?}: {reason}")]
    InvalidId {
        /// Rejected id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the document does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result alias for adapter calls.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Descriptive attributes carried alongside a document body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Last modification time on the owning backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    /// Backend specific attributes carried through unchanged.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Body plus metadata as returned by [`StorageAdapter::get`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredDocument {
    /// Raw body.
    pub content: Vec<u8>,
    /// Attributes stored with the body.
    pub metadata: DocumentMetadata,
}

impl StoredDocument {
    /// Digest of the body as read.
    pub fn digest(&self) -> ContentDigest {
        ContentDigest::of(&self.content)
    }
}

/// Uniform capability set every storage backend implements.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short human readable description used in logs.
    fn describe(&self) -> String;

    /// Read a document; `NotFound` when absent.
    async fn get(&self, id: &str) -> StorageResult<StoredDocument>;

    /// Store `content` under `id`, replacing any previous body. Returns the
    /// digest of what the backend believes it stored.
    async fn put(
        &self,
        id: &str,
        content: &[u8],
        metadata: &DocumentMetadata,
    ) -> StorageResult<ContentDigest>;

    /// Remove a document; `NotFound` when absent.
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// Document ids starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Adapter family named by a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Filesystem-backed workspace.
    Local,
    /// Process-local map, for dry runs and tests.
    Memory,
    /// Bucket storage; adapter supplied by the embedding application.
    ObjectStorage,
    /// Hosted document service; adapter supplied by the embedding
    /// application.
    Hosted,
}

impl ProviderKind {
    /// Persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Memory => "memory",
            ProviderKind::ObjectStorage => "object_storage",
            ProviderKind::Hosted => "hosted",
        }
    }

    /// Parse a kind, accepting the older backend aliases.
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        match raw {
            "local" => Ok(ProviderKind::Local),
            "memory" => Ok(ProviderKind::Memory),
            "object_storage" | "s3" => Ok(ProviderKind::ObjectStorage),
            "hosted" | "google" | "remote-hermes" => Ok(ProviderKind::Hosted),
            other => Err(MigrationError::InvalidConfiguration(format!(
                "unknown provider kind {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a registration may be resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Resolvable.
    #[default]
    Active,
    /// Kept for history; never resolves.
    Inactive,
}

impl ProviderStatus {
    /// Persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Inactive => "inactive",
        }
    }

    /// Inverse of [`ProviderStatus::as_str`].
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        match raw {
            "active" => Ok(ProviderStatus::Active),
            "inactive" => Ok(ProviderStatus::Inactive),
            other => Err(MigrationError::Internal(format!(
                "unknown provider status {other:?}"
            ))),
        }
    }
}

/// Operator-managed description of a storage provider. Workers never mutate
/// registrations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderRegistration {
    /// Stable id; kept across upserts of the same name.
    pub id: ProviderId,
    /// Logical name jobs refer to. Never contains `/`.
    pub name: String,
    /// Adapter family.
    pub kind: ProviderKind,
    /// Adapter specific settings, e.g. `{"root": "..."}` for `local`.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Default provider of the deployment.
    #[serde(default)]
    pub is_primary: bool,
    /// Whether jobs may read from it.
    #[serde(default = "default_true")]
    pub is_readable: bool,
    /// Whether jobs may write to it.
    #[serde(default = "default_true")]
    pub is_writable: bool,
    /// Active or inactive.
    #[serde(default)]
    pub status: ProviderStatus,
}

fn default_true() -> bool {
    true
}

/// Provider names form the route part of idempotency keys, which uses `/`
/// as its separator.
pub fn validate_provider_name(name: &str) -> Result<(), MigrationError> {
    if name.trim().is_empty() {
        return Err(MigrationError::InvalidConfiguration(
            "provider name must not be empty".into(),
        ));
    }
    if name.contains('/') {
        return Err(MigrationError::InvalidConfiguration(format!(
            "provider name {name:?} must not contain '/'"
        )));
    }
    Ok(())
}

impl ProviderRegistration {
    /// Active, readable and writable registration with an empty config.
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: ProviderId::new(),
            name: name.into(),
            kind,
            config: serde_json::Value::Object(Default::default()),
            is_primary: false,
            is_readable: true,
            is_writable: true,
            status: ProviderStatus::Active,
        }
    }

    /// Replace the adapter config.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Mark as not writable.
    pub fn read_only(mut self) -> Self {
        self.is_writable = false;
        self
    }

    /// Mark as the primary provider.
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Whether the registration may be resolved.
    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }
}
