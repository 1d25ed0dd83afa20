//! Configuration library for docmigrate.
//!
//! Composes the effective [`Config`] from an optional `.env` file, a TOML or
//! JSON config file, and environment overrides. Both the worker binary and
//! embedders go through [`ConfigLoader`] so defaults and guard rails live in
//! one place.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, error::ConfigLoadError};
pub use models::{Config, ConfigMetadata, ConfigSource, DatabaseConfig, ProviderSeed};
pub use validation::{ConfigWarning, ConfigWarnings};
