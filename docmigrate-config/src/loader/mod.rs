//! Layered loading: defaults, TOML file, environment.

pub mod db_url;
pub mod error;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::models::sources::{EnvConfig, FileConfig};
use crate::models::{
    Config, ConfigMetadata, ConfigSource, DEFAULT_MAX_CONNECTIONS, DatabaseConfig,
};
use crate::validation::{self, ConfigWarnings};
use error::ConfigLoadError;

/// Files searched, in order, when no path is given explicitly.
pub const DEFAULT_CONFIG_CANDIDATES: &[&str] = &["docmigrate.toml", "config/docmigrate.toml"];

/// Effective configuration plus the warnings raised while composing it.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    /// Effective configuration.
    pub config: Config,
    /// Non-fatal findings.
    pub warnings: ConfigWarnings,
}

/// Composes [`Config`] from `.env`, an optional config file and env
/// overrides, in that order of increasing precedence.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    skip_env_file: bool,
    search_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader with default discovery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of `DOCMIGRATE_CONFIG_PATH` or the default
    /// candidates. A missing explicit file is an error.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Read this `.env` file instead of the one in the working directory.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Do not read any `.env` file.
    pub fn skip_env_file(mut self) -> Self {
        self.skip_env_file = true;
        self
    }

    /// Directory the default candidates are resolved against. Defaults to
    /// the working directory.
    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_root = Some(root.into());
        self
    }

    /// Apply `.env`, snapshot the environment and compose the config.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        let env = EnvConfig::gather()?;
        let mut load = self.load_with_env(&env)?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Compose the config against an explicit environment snapshot.
    pub fn load_with_env(&self, env: &EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file, config_path, source) = match self.resolve_config_path(env)? {
            Some(path) => {
                let (file, source) = read_config_file(&path)?;
                info!(path = %path.display(), "loaded configuration file");
                (file, Some(path), source)
            }
            None => {
                debug!("no configuration file found; using defaults");
                (FileConfig::default(), None, ConfigSource::Defaults)
            }
        };

        let database_url = db_url::resolve_database_url(env, &file.database)?;
        if let Some((_, url_source)) = &database_url {
            debug!(source = ?url_source, "resolved database url");
        }

        let mut engine = file.engine;
        if let Some(workers) = env.workers {
            engine.worker.workers = workers;
        }
        if let Some(interval) = env.poll_interval {
            engine.worker.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(max_attempts) = env.max_attempts {
            engine.retry.max_attempts = max_attempts;
        }

        let config = Config {
            database: DatabaseConfig {
                primary_url: database_url.map(|(url, _)| url),
                max_connections: file
                    .database
                    .max_connections
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
            engine,
            providers: file.providers,
            metadata: ConfigMetadata {
                config_path,
                source,
                env_file_loaded: false,
            },
        };

        let warnings = validation::validate(&config)?;
        for warning in &warnings.items {
            warn!("{warning}");
        }

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.skip_env_file {
            return Ok(false);
        }
        match &self.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|()| true)
                .map_err(|source| ConfigLoadError::EnvFile {
                    path: path.clone(),
                    source,
                }),
            None => match dotenvy::dotenv() {
                Ok(path) => {
                    debug!(path = %path.display(), "loaded .env file");
                    Ok(true)
                }
                Err(err) if err.not_found() => Ok(false),
                Err(source) => Err(ConfigLoadError::EnvFile {
                    path: PathBuf::from(".env"),
                    source,
                }),
            },
        }
    }

    fn resolve_config_path(&self, env: &EnvConfig) -> Result<Option<PathBuf>, ConfigLoadError> {
        if let Some(path) = self.config_path.as_ref().or(env.config_path.as_ref()) {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfigFile { path: path.clone() });
            }
            return Ok(Some(path.clone()));
        }

        let root = self.search_root.clone().unwrap_or_else(|| PathBuf::from("."));
        Ok(DEFAULT_CONFIG_CANDIDATES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.is_file()))
    }
}

fn read_config_file(path: &Path) -> Result<(FileConfig, ConfigSource), ConfigLoadError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&raw)
            .map(|file| (file, ConfigSource::Json))
            .map_err(|source| ConfigLoadError::Json {
                path: path.to_path_buf(),
                source,
            })
    } else {
        toml::from_str(&raw)
            .map(|file| (file, ConfigSource::Toml))
            .map_err(|source| ConfigLoadError::Toml {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let load = ConfigLoader::new()
            .with_search_root(dir.path())
            .load_with_env(&EnvConfig::default())
            .unwrap();
        assert_eq!(load.config.metadata.source, ConfigSource::Defaults);
        assert_eq!(load.config.engine.worker.workers, 4);
        assert_eq!(load.config.database.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(load.config.database.primary_url.is_none());
        assert!(!load.warnings.is_empty());
    }

    #[test]
    fn default_candidate_in_config_dir_is_found() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config/docmigrate.toml",
            "[engine.worker]\nworkers = 2\n",
        );
        let load = ConfigLoader::new()
            .with_search_root(dir.path())
            .load_with_env(&EnvConfig::default())
            .unwrap();
        assert_eq!(load.config.metadata.source, ConfigSource::Toml);
        assert_eq!(load.config.engine.worker.workers, 2);
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "engine.json",
            r#"{
                "database": { "url": "postgres://file@localhost/db", "max_connections": 4 },
                "engine": { "worker": { "workers": 2, "poll_interval_ms": 5000 } }
            }"#,
        );
        let env = EnvConfig {
            database_url: Some("postgres://env@localhost/db".into()),
            workers: Some(6),
            poll_interval: Some(Duration::from_millis(250)),
            max_attempts: Some(7),
            ..Default::default()
        };
        let load = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(&env)
            .unwrap();
        let config = load.config;
        assert_eq!(config.metadata.source, ConfigSource::Json);
        assert_eq!(config.engine.worker.workers, 6);
        assert_eq!(config.engine.worker.poll_interval_ms, 250);
        assert_eq!(config.engine.retry.max_attempts, 7);
        assert_eq!(config.database.max_connections, 4);
        assert!(config.database.primary_url.unwrap().contains("env@"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = ConfigLoader::new()
            .with_config_path("/definitely/not/here.toml")
            .load_with_env(&EnvConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfigFile { .. }));
    }

    #[test]
    fn malformed_toml_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "docmigrate.toml", "[engine.worker\nworkers = ");
        let err = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(&EnvConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Toml { .. }));
        assert!(err.to_string().contains("docmigrate.toml"));
    }

    #[test]
    fn invalid_engine_values_fail_validation() {
        let env = EnvConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_search_root(dir.path())
            .load_with_env(&env)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid { .. }));
    }
}
