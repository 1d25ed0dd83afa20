//! Name to adapter resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::{
    InMemoryAdapter, LocalWorkspaceAdapter, ProviderKind, ProviderRegistration,
    StorageAdapter,
};
use crate::error::{MigrationError, Result};

/// Builds adapters for persisted registrations when the registry refreshes.
pub trait AdapterFactory: Send + Sync {
    /// Adapter for `registration`, or `InvalidConfiguration` when this
    /// factory cannot serve its kind.
    fn build(&self, registration: &ProviderRegistration) -> Result<Arc<dyn StorageAdapter>>;
}

/// Factory for the adapters that ship with the engine. Object storage and
/// hosted providers must be registered explicitly with
/// [`ProviderRegistry::register`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinAdapterFactory;

impl AdapterFactory for BuiltinAdapterFactory {
    fn build(&self, registration: &ProviderRegistration) -> Result<Arc<dyn StorageAdapter>> {
        match registration.kind {
            ProviderKind::Local => Ok(Arc::new(LocalWorkspaceAdapter::from_config(
                &registration.config,
            )?)),
            ProviderKind::Memory => Ok(Arc::new(InMemoryAdapter::new(&registration.name))),
            other => Err(MigrationError::InvalidConfiguration(format!(
                "provider {} uses kind {other}, which has no built-in adapter",
                registration.name
            ))),
        }
    }
}

#[derive(Clone)]
struct RegisteredProvider {
    registration: ProviderRegistration,
    adapter: Arc<dyn StorageAdapter>,
}

/// Lookup table from logical provider name to adapter.
///
/// Resolution is a pure read. The table is replaced wholesale on refresh so
/// resolvers never observe a half-built registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<HashMap<String, RegisteredProvider>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a provider. Inactive registrations are accepted but
    /// never resolve.
    pub fn register(&self, registration: ProviderRegistration, adapter: Arc<dyn StorageAdapter>) {
        debug!(
            target: "migration::registry",
            provider = %registration.name,
            kind = %registration.kind,
            adapter = %adapter.describe(),
            "provider registered"
        );
        let mut guard = self.providers.write().unwrap_or_else(|p| p.into_inner());
        guard.insert(
            registration.name.clone(),
            RegisteredProvider {
                registration,
                adapter,
            },
        );
    }

    /// Rebuild the table from registrations. Providers that already have an
    /// adapter keep it; new ones are built with `factory`. Registrations the
    /// factory cannot build are logged and left out.
    pub fn refresh(
        &self,
        registrations: Vec<ProviderRegistration>,
        factory: &dyn AdapterFactory,
    ) -> usize {
        let current = {
            let guard = self.providers.read().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };

        let mut next = HashMap::with_capacity(registrations.len());
        for registration in registrations {
            let adapter = match current.get(&registration.name) {
                Some(existing) if existing.registration.kind == registration.kind
                    && existing.registration.config == registration.config =>
                {
                    Arc::clone(&existing.adapter)
                }
                _ => match factory.build(&registration) {
                    Ok(adapter) => adapter,
                    Err(err) => {
                        warn!(
                            target: "migration::registry",
                            provider = %registration.name,
                            error = %err,
                            "skipping provider without adapter"
                        );
                        continue;
                    }
                },
            };
            next.insert(
                registration.name.clone(),
                RegisteredProvider {
                    registration,
                    adapter,
                },
            );
        }

        let count = next.len();
        let mut guard = self.providers.write().unwrap_or_else(|p| p.into_inner());
        *guard = next;
        debug!(target: "migration::registry", providers = count, "provider registry refreshed");
        count
    }

    /// Adapter for an active provider.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn StorageAdapter>> {
        let guard = self.providers.read().unwrap_or_else(|p| p.into_inner());
        match guard.get(name) {
            Some(entry) if entry.registration.is_active() => Ok(Arc::clone(&entry.adapter)),
            _ => Err(MigrationError::ProviderNotFound(name.to_string())),
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let guard = self.providers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderStatus;

    #[test]
    fn resolve_unknown_provider_is_not_found() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(MigrationError::ProviderNotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn inactive_registration_does_not_resolve() {
        let registry = ProviderRegistry::new();
        let mut registration = ProviderRegistration::new("archive", ProviderKind::Memory);
        registration.status = ProviderStatus::Inactive;
        registry.register(registration, Arc::new(InMemoryAdapter::new("archive")));
        assert!(registry.resolve("archive").is_err());
    }

    #[test]
    fn refresh_keeps_existing_adapters_and_drops_removed_ones() {
        let registry = ProviderRegistry::new();
        let keep = ProviderRegistration::new("keep", ProviderKind::Memory);
        let removed = ProviderRegistration::new("drop", ProviderKind::Memory);
        let adapter: Arc<dyn StorageAdapter> = Arc::new(InMemoryAdapter::new("keep"));
        registry.register(keep.clone(), Arc::clone(&adapter));
        registry.register(removed, Arc::new(InMemoryAdapter::new("drop")));

        let count = registry.refresh(vec![keep], &BuiltinAdapterFactory);

        assert_eq!(count, 1);
        let resolved = registry.resolve("keep").expect("kept");
        assert!(Arc::ptr_eq(&resolved, &adapter));
        assert!(registry.resolve("drop").is_err());
    }

    #[test]
    fn refresh_adds_registrations_the_table_has_not_seen() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve("scratch").is_err());

        let count = registry.refresh(
            vec![ProviderRegistration::new("scratch", ProviderKind::Memory)],
            &BuiltinAdapterFactory,
        );

        assert_eq!(count, 1);
        assert!(registry.resolve("scratch").is_ok());
    }

    #[test]
    fn refresh_skips_kinds_without_builtin_adapter() {
        let registry = ProviderRegistry::new();
        let count = registry.refresh(
            vec![ProviderRegistration::new("bucket", ProviderKind::ObjectStorage)],
            &BuiltinAdapterFactory,
        );
        assert_eq!(count, 0);
        assert!(registry.names().is_empty());
    }
}
