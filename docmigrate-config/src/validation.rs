//! Guard rails applied after the config layers are merged.

use std::collections::HashSet;
use std::fmt;

use docmigrate_core::migration::config::{MAX_ATTEMPTS_LIMIT, MAX_BATCH_SIZE, MAX_CONCURRENCY};
use docmigrate_core::provider::validate_provider_name;

use crate::ConfigLoadError;
use crate::models::Config;

/// Non-fatal observations surfaced to the operator at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Commands that need the store will fail.
    NoDatabaseUrl,
    /// Nothing to seed.
    NoProviders,
    /// Claims may be reaped while a batch is still being worked.
    ShortClaimTtl {
        /// Configured claim TTL.
        ttl_secs: i64,
        /// Configured poll interval.
        poll_interval_ms: u64,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::NoDatabaseUrl => {
                f.write_str("no database url configured; set DATABASE_URL or [database] url")
            }
            ConfigWarning::NoProviders => {
                f.write_str("no providers declared; `providers sync` will have nothing to do")
            }
            ConfigWarning::ShortClaimTtl {
                ttl_secs,
                poll_interval_ms,
            } => write!(
                f,
                "claim ttl of {ttl_secs}s is not longer than the poll interval ({poll_interval_ms}ms)"
            ),
        }
    }
}

/// Warnings collected by [`validate`].
#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    /// In the order they were found.
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    /// Whether nothing was flagged.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn check_range(field: &str, value: u32, max: u32) -> Result<(), ConfigLoadError> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be between 1 and {max}, got {value}")))
    }
}

/// Reject configurations the engine cannot run with and collect warnings
/// for the questionable ones.
pub fn validate(config: &Config) -> Result<ConfigWarnings, ConfigLoadError> {
    let engine = &config.engine;
    let mut warnings = ConfigWarnings::default();

    if engine.worker.workers == 0 {
        return Err(invalid("engine.worker.workers", "must be at least 1"));
    }
    if engine.worker.poll_interval_ms == 0 {
        return Err(invalid("engine.worker.poll_interval_ms", "must be positive"));
    }
    check_range(
        "engine.worker.claim_batch_limit",
        engine.worker.claim_batch_limit,
        MAX_BATCH_SIZE,
    )?;
    if engine.worker.claim_ttl_secs <= 0 {
        return Err(invalid("engine.worker.claim_ttl_secs", "must be positive"));
    }
    check_range("engine.retry.max_attempts", engine.retry.max_attempts, MAX_ATTEMPTS_LIMIT)?;
    if engine.retry.backoff_max_ms < engine.retry.backoff_base_ms {
        return Err(invalid(
            "engine.retry.backoff_max_ms",
            "must not be smaller than backoff_base_ms",
        ));
    }
    if !(0.0..=1.0).contains(&engine.retry.jitter_ratio) {
        return Err(invalid("engine.retry.jitter_ratio", "must be within 0.0..=1.0"));
    }
    check_range("engine.jobs.concurrency", engine.jobs.concurrency, MAX_CONCURRENCY)?;
    check_range("engine.jobs.batch_size", engine.jobs.batch_size, MAX_BATCH_SIZE)?;

    let mut names = HashSet::new();
    let mut primaries = 0;
    for seed in &config.providers {
        let name = seed.name.trim();
        validate_provider_name(name).map_err(|e| invalid("provider.name", e.to_string()))?;
        if !names.insert(name) {
            return Err(invalid("provider.name", format!("duplicate provider {name:?}")));
        }
        if seed.primary {
            primaries += 1;
        }
    }
    if primaries > 1 {
        return Err(invalid("provider.primary", "at most one provider may be primary"));
    }

    if config.database.primary_url.is_none() {
        warnings.items.push(ConfigWarning::NoDatabaseUrl);
    }
    if config.providers.is_empty() {
        warnings.items.push(ConfigWarning::NoProviders);
    }
    let ttl_ms = u64::try_from(engine.worker.claim_ttl_secs)
        .unwrap_or_default()
        .saturating_mul(1_000);
    if ttl_ms <= engine.worker.poll_interval_ms {
        warnings.items.push(ConfigWarning::ShortClaimTtl {
            ttl_secs: engine.worker.claim_ttl_secs,
            poll_interval_ms: engine.worker.poll_interval_ms,
        });
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigMetadata, DatabaseConfig, ProviderSeed};
    use docmigrate_core::EngineConfig;
    use docmigrate_core::provider::ProviderKind;

    fn config() -> Config {
        Config {
            database: DatabaseConfig {
                primary_url: Some("postgres://localhost/docmigrate".into()),
                max_connections: 10,
            },
            engine: EngineConfig::default(),
            providers: vec![seed("workspace", true), seed("archive", false)],
            metadata: ConfigMetadata::default(),
        }
    }

    fn seed(name: &str, primary: bool) -> ProviderSeed {
        ProviderSeed {
            name: name.into(),
            kind: ProviderKind::Memory,
            config: serde_json::json!({}),
            primary,
            readable: true,
            writable: true,
        }
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = validate(&config()).unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings.items);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = config();
        config.engine.worker.workers = 0;
        assert!(matches!(
            validate(&config),
            Err(ConfigLoadError::Invalid { field, .. }) if field == "engine.worker.workers"
        ));
    }

    #[test]
    fn attempts_above_limit_are_rejected() {
        let mut config = config();
        config.engine.retry.max_attempts = MAX_ATTEMPTS_LIMIT + 1;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn duplicate_and_multiple_primary_providers_are_rejected() {
        let mut duplicate = config();
        duplicate.providers.push(seed("archive", false));
        assert!(validate(&duplicate).is_err());

        let mut two_primaries = config();
        two_primaries.providers.push(seed("third", true));
        assert!(validate(&two_primaries).is_err());
    }

    #[test]
    fn provider_names_must_be_usable_in_routes() {
        for bad in ["", "team/docs"] {
            let mut config = config();
            config.providers.push(seed(bad, false));
            assert!(matches!(
                validate(&config),
                Err(ConfigLoadError::Invalid { field, .. }) if field == "provider.name"
            ));
        }
    }

    #[test]
    fn missing_url_and_providers_warn() {
        let mut config = config();
        config.database.primary_url = None;
        config.providers.clear();
        let warnings = validate(&config).unwrap();
        assert!(warnings.items.contains(&ConfigWarning::NoDatabaseUrl));
        assert!(warnings.items.contains(&ConfigWarning::NoProviders));
    }
}
