//! Loader errors.

use std::path::PathBuf;

use thiserror::Error;

/// Reasons a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// `.env` file exists but could not be applied.
    #[error("failed to load .env file at {path}: {source}")]
    EnvFile {
        /// File that failed.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: dotenvy::Error,
    },

    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the model.
    #[error("failed to parse TOML config {path}: {source}")]
    Toml {
        /// File that failed.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },

    /// Config file is not valid JSON for the model.
    #[error("failed to parse JSON config {path}: {source}")]
    Json {
        /// File that failed.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// Explicitly requested config file is missing.
    #[error("config file {path} does not exist")]
    MissingConfigFile {
        /// Requested path.
        path: PathBuf,
    },

    /// Environment variable with an unparseable value.
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// `DATABASE_URL_FILE` could not be read.
    #[error("failed to read secret file {path}: {source}")]
    SecretFileIo {
        /// Secret file path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Database URL does not parse.
    #[error("invalid database url: {source}")]
    InvalidDatabaseUrl {
        /// Parser error.
        #[source]
        source: url::ParseError,
    },

    /// Database URL is not a postgres URL.
    #[error("database url scheme {scheme:?} is not postgres")]
    UnsupportedDatabaseScheme {
        /// Scheme found.
        scheme: String,
    },

    /// A merged value is out of range or inconsistent.
    #[error("invalid configuration for {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}
