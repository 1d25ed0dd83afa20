//! Resolved configuration model.

pub mod sources;

use std::path::PathBuf;

use docmigrate_core::EngineConfig;
use docmigrate_core::provider::{ProviderKind, ProviderRegistration};
use serde::{Deserialize, Serialize};

/// Effective configuration after every layer is applied.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection settings.
    pub database: DatabaseConfig,
    /// Engine knobs passed to the manager and worker pool.
    pub engine: EngineConfig,
    /// Providers to upsert on `providers sync`.
    pub providers: Vec<ProviderSeed>,
    /// Where the values came from.
    pub metadata: ConfigMetadata,
}

/// Postgres connection settings.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Validated connection URL, when one was configured.
    pub primary_url: Option<String>,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
}

/// Pool size when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Provider registration as written in the config file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderSeed {
    /// Logical provider name; must not contain `/`.
    pub name: String,
    /// Adapter family.
    pub kind: ProviderKind,
    /// Adapter specific settings.
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    /// Primary provider flag.
    #[serde(default)]
    pub primary: bool,
    /// Whether jobs may read from it.
    #[serde(default = "default_true")]
    pub readable: bool,
    /// Whether jobs may write to it.
    #[serde(default = "default_true")]
    pub writable: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_true() -> bool {
    true
}

impl ProviderSeed {
    /// Active registration carrying the seed's flags.
    pub fn to_registration(&self) -> ProviderRegistration {
        let mut registration =
            ProviderRegistration::new(self.name.clone(), self.kind).with_config(self.config.clone());
        registration.is_primary = self.primary;
        registration.is_readable = self.readable;
        registration.is_writable = self.writable;
        registration
    }
}

/// Where the file layer of the config came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// No file; defaults plus environment only.
    #[default]
    Defaults,
    /// A `.toml` file.
    Toml,
    /// A `.json` file.
    Json,
}

/// Provenance of a loaded [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    /// File the file layer was read from.
    pub config_path: Option<PathBuf>,
    /// Format of that file.
    pub source: ConfigSource,
    /// Whether a `.env` file was applied.
    pub env_file_loaded: bool,
}
