//! Raw configuration sources before they are merged.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use docmigrate_core::EngineConfig;

use super::ProviderSeed;
use crate::loader::error::ConfigLoadError;
use crate::util::{non_empty_var, parse_duration};

/// Raw configuration as defined in a TOML or JSON file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    /// `[database]` table.
    #[serde(default)]
    pub database: FileDatabaseConfig,
    /// `[engine]` table.
    #[serde(default)]
    pub engine: EngineConfig,
    /// `[[provider]]` tables.
    #[serde(default, rename = "provider", alias = "providers")]
    pub providers: Vec<ProviderSeed>,
}

/// `[database]` table of a config file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    /// Connection URL; `DATABASE_URL` wins over it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Pool size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    /// `DOCMIGRATE_CONFIG_PATH`.
    pub config_path: Option<PathBuf>,
    /// `DATABASE_URL`.
    pub database_url: Option<String>,
    /// `DATABASE_URL_FILE`.
    pub database_url_file: Option<PathBuf>,
    /// `DOCMIGRATE_WORKERS`.
    pub workers: Option<usize>,
    /// `DOCMIGRATE_POLL_INTERVAL`.
    pub poll_interval: Option<Duration>,
    /// `DOCMIGRATE_MAX_ATTEMPTS`.
    pub max_attempts: Option<u32>,
}

impl EnvConfig {
    /// Snapshot the process environment. Malformed numeric or duration
    /// values are rejected rather than ignored.
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Ok(Self {
            config_path: non_empty_var("DOCMIGRATE_CONFIG_PATH").map(PathBuf::from),
            database_url: non_empty_var("DATABASE_URL"),
            database_url_file: non_empty_var("DATABASE_URL_FILE").map(PathBuf::from),
            workers: parse_var("DOCMIGRATE_WORKERS", |raw| {
                raw.parse::<usize>().map_err(|e| e.to_string())
            })?,
            poll_interval: parse_var("DOCMIGRATE_POLL_INTERVAL", parse_duration)?,
            max_attempts: parse_var("DOCMIGRATE_MAX_ATTEMPTS", |raw| {
                raw.parse::<u32>().map_err(|e| e.to_string())
            })?,
        })
    }
}

fn parse_var<T>(
    name: &'static str,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigLoadError> {
    let Some(raw) = non_empty_var(name) else {
        return Ok(None);
    };
    parse(&raw)
        .map(Some)
        .map_err(|reason| ConfigLoadError::InvalidEnv {
            name,
            value: raw,
            reason,
        })
}
