//! Database URL resolution and validation.

use std::{fs::read_to_string, path::Path};

use url::Url;

use crate::{
    ConfigLoadError,
    models::sources::{EnvConfig, FileDatabaseConfig},
};

/// Source of the effective PostgreSQL connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseUrlSource {
    /// `DATABASE_URL`.
    Env,
    /// Contents of `DATABASE_URL_FILE`.
    SecretFile,
    /// `[database] url` in the config file.
    File,
}

/// Pick the connection URL by precedence: env, secret file, config file.
/// Whatever wins is validated before it is returned.
pub fn resolve_database_url(
    env: &EnvConfig,
    file_database: &FileDatabaseConfig,
) -> Result<Option<(String, DatabaseUrlSource)>, ConfigLoadError> {
    let candidate = if let Some(url) = env.database_url.clone() {
        Some((url, DatabaseUrlSource::Env))
    } else if let Some(path) = env.database_url_file.as_ref()
        && let Some(url) = read_secret_file(path)?
    {
        Some((url, DatabaseUrlSource::SecretFile))
    } else {
        file_database
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| (url.to_string(), DatabaseUrlSource::File))
    };

    candidate
        .map(|(url, source)| validate_database_url(&url).map(|url| (url, source)))
        .transpose()
}

/// Normalise `raw` and require a postgres scheme.
pub fn validate_database_url(raw: &str) -> Result<String, ConfigLoadError> {
    let parsed = Url::parse(raw.trim())
        .map_err(|source| ConfigLoadError::InvalidDatabaseUrl { source })?;
    match parsed.scheme() {
        "postgres" | "postgresql" => Ok(parsed.to_string()),
        other => Err(ConfigLoadError::UnsupportedDatabaseScheme {
            scheme: other.to_string(),
        }),
    }
}

/// Trimmed file contents; `None` for an empty file.
pub fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn env_url_wins_over_file() {
        let env = EnvConfig {
            database_url: Some("postgres://env@localhost/db".into()),
            ..Default::default()
        };
        let file = FileDatabaseConfig {
            url: Some("postgres://file@localhost/db".into()),
            ..Default::default()
        };
        let (url, source) = resolve_database_url(&env, &file).unwrap().unwrap();
        assert_eq!(source, DatabaseUrlSource::Env);
        assert!(url.contains("env@"));
    }

    #[test]
    fn secret_file_is_trimmed() {
        let mut secret = tempfile::NamedTempFile::new().unwrap();
        writeln!(secret, "  postgresql://svc@db:5432/docs  ").unwrap();
        let env = EnvConfig {
            database_url_file: Some(secret.path().to_path_buf()),
            ..Default::default()
        };
        let (url, source) = resolve_database_url(&env, &FileDatabaseConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(source, DatabaseUrlSource::SecretFile);
        assert_eq!(url, "postgresql://svc@db:5432/docs");
    }

    #[test]
    fn non_postgres_scheme_is_rejected() {
        let err = validate_database_url("mysql://localhost/db").unwrap_err();
        assert!(matches!(err, ConfigLoadError::UnsupportedDatabaseScheme { .. }));
    }

    #[test]
    fn nothing_configured_is_none() {
        let resolved =
            resolve_database_url(&EnvConfig::default(), &FileDatabaseConfig::default()).unwrap();
        assert!(resolved.is_none());
    }
}
