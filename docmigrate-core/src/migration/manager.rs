//! Job lifecycle owner.
//!
//! The manager validates requests, reads and fingerprints source documents
//! before anything is written, and drives status transitions. Per-item state
//! and counters only change inside the store.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::config::{EngineConfig, MAX_ATTEMPTS_LIMIT, MAX_BATCH_SIZE, MAX_CONCURRENCY};
use super::item::{ItemFilter, MigrationItem};
use super::job::{CreateJobRequest, DocumentSelection, JobStatus, MigrationJob, Strategy};
use super::progress::{InvariantReport, Progress};
use crate::error::{MigrationError, Result};
use crate::persistence::{MigrationStore, NewItem};
use crate::provider::{
    AdapterFactory, ProviderRegistration, ProviderRegistry, StorageAdapter, StorageError,
};
use crate::types::ids::JobId;

/// Validates requests and drives job lifecycle transitions.
#[derive(Clone)]
pub struct MigrationManager {
    store: Arc<dyn MigrationStore>,
    registry: ProviderRegistry,
    config: EngineConfig,
}

impl fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl MigrationManager {
    /// Manager over `store` resolving providers through `registry`.
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: ProviderRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    /// Adapter registry shared with the worker pool.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist a registration and make `adapter` resolvable under its name.
    pub async fn register_provider(
        &self,
        registration: ProviderRegistration,
        adapter: Arc<dyn StorageAdapter>,
    ) -> Result<ProviderRegistration> {
        let stored = self.store.upsert_provider(&registration).await?;
        self.registry.register(stored.clone(), adapter);
        Ok(stored)
    }

    /// Rebuild the registry from persisted registrations.
    pub async fn sync_providers(&self, factory: &dyn AdapterFactory) -> Result<usize> {
        let registrations = self.store.list_providers().await?;
        let persisted = registrations.len();
        let resolvable = self.registry.refresh(registrations, factory);
        info!(target: "migration::manager", persisted, resolvable, "provider registry synced");
        Ok(resolvable)
    }

    async fn active_provider(&self, name: &str) -> Result<ProviderRegistration> {
        let registration = self
            .store
            .get_provider(name)
            .await?
            .filter(ProviderRegistration::is_active)
            .ok_or_else(|| MigrationError::ProviderNotFound(name.to_string()))?;
        // A persisted registration without a live adapter cannot be used.
        self.registry.resolve(name)?;
        Ok(registration)
    }

    /// Validate `request`, fingerprint its selection and persist the job
    /// with its items in one step. The job starts out `pending`.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<MigrationJob> {
        let job_name = request.job_name.trim().to_string();
        if job_name.is_empty() {
            return Err(MigrationError::InvalidConfiguration(
                "job name must not be empty".into(),
            ));
        }
        if request.source_provider == request.dest_provider {
            return Err(MigrationError::InvalidConfiguration(format!(
                "source and destination are both {}",
                request.source_provider
            )));
        }

        let defaults = &self.config.jobs;
        let concurrency = request.concurrency.unwrap_or(defaults.concurrency);
        let batch_size = request.batch_size.unwrap_or(defaults.batch_size);
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.retry.max_attempts);
        check_range("concurrency", concurrency, MAX_CONCURRENCY)?;
        check_range("batch_size", batch_size, MAX_BATCH_SIZE)?;
        check_range("max_attempts", max_attempts, MAX_ATTEMPTS_LIMIT)?;

        let source = self.active_provider(&request.source_provider).await?;
        let dest = self.active_provider(&request.dest_provider).await?;

        if !source.is_readable {
            return Err(MigrationError::InvalidConfiguration(format!(
                "source provider {} is not readable",
                source.name
            )));
        }
        let dry_copy = request.dry_run && request.strategy == Strategy::Copy;
        if !dest.is_writable && !dry_copy {
            return Err(MigrationError::ProviderUnwritable(dest.name));
        }
        if request.strategy == Strategy::Move && !source.is_writable {
            return Err(MigrationError::ProviderUnwritable(format!(
                "{} (move deletes from the source)",
                source.name
            )));
        }

        let now = Utc::now();
        let job = MigrationJob {
            id: JobId::new(),
            job_name,
            source_provider_id: source.id,
            dest_provider_id: dest.id,
            source_provider: source.name,
            dest_provider: dest.name,
            strategy: request.strategy,
            status: JobStatus::Pending,
            selection: request.selection.clone(),
            dry_run: request.dry_run,
            concurrency,
            batch_size,
            max_attempts,
            created_by: request
                .created_by
                .filter(|who| !who.trim().is_empty())
                .unwrap_or_else(|| defaults.created_by.clone()),
            total_documents: 0,
            migrated_documents: 0,
            failed_documents: 0,
            skipped_documents: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        // Read the selection before writing the job so a missing document
        // leaves nothing behind.
        let items = match &request.selection {
            DocumentSelection::None => Vec::new(),
            DocumentSelection::Explicit { document_ids } => {
                self.prepare_items(&job, document_ids).await?
            }
            DocumentSelection::Prefix { prefix } => {
                let ids = self.list_source(&job, prefix).await?;
                self.prepare_items(&job, &ids).await?
            }
        };

        let queued = self.store.create_job(&job, items).await?;

        info!(
            target: "migration::manager",
            job_id = %job.id,
            job_name = %job.job_name,
            source = %job.source_provider,
            dest = %job.dest_provider,
            strategy = %job.strategy,
            dry_run = job.dry_run,
            queued,
            "migration job created"
        );
        self.store.get_job(job.id).await
    }

    /// Fingerprint and enqueue documents. Returns how many new items were
    /// written; documents already queued with identical content add nothing.
    pub async fn queue_documents(&self, job_id: JobId, document_ids: &[String]) -> Result<u64> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.accepts_documents() {
            return Err(MigrationError::InvalidTransition(format!(
                "job {job_id} is {} and no longer accepts documents",
                job.status
            )));
        }

        let items = self.prepare_items(&job, document_ids).await?;
        if items.is_empty() {
            return Ok(0);
        }
        let requested = items.len();
        let queued = self.store.queue_items(job_id, items).await?;
        debug!(
            target: "migration::manager",
            job_id = %job_id,
            requested,
            queued,
            "documents queued"
        );
        Ok(queued)
    }

    /// Queue every source document whose id starts with `prefix`.
    pub async fn queue_prefix(&self, job_id: JobId, prefix: &str) -> Result<u64> {
        let job = self.store.get_job(job_id).await?;
        let ids = self.list_source(&job, prefix).await?;
        self.queue_documents(job_id, &ids).await
    }

    async fn list_source(&self, job: &MigrationJob, prefix: &str) -> Result<Vec<String>> {
        let source = self.registry.resolve(&job.source_provider)?;
        source.list(prefix).await.map_err(|e| {
            MigrationError::Transfer(format!(
                "listing {prefix:?} on {} failed: {e}",
                job.source_provider
            ))
        })
    }

    async fn prepare_items(&self, job: &MigrationJob, document_ids: &[String]) -> Result<Vec<NewItem>> {
        let source = self.registry.resolve(&job.source_provider)?;
        let mut seen = HashSet::with_capacity(document_ids.len());
        let mut items = Vec::with_capacity(document_ids.len());

        for document_id in document_ids {
            if document_id.trim().is_empty() {
                return Err(MigrationError::InvalidConfiguration(
                    "document id must not be empty".into(),
                ));
            }
            if !seen.insert(document_id.as_str()) {
                continue;
            }

            let document = source.get(document_id).await.map_err(|e| match e {
                StorageError::NotFound(_) => MigrationError::Transfer(format!(
                    "source document {document_id} not found on {}",
                    job.source_provider
                )),
                other => MigrationError::Transfer(format!(
                    "reading {document_id} from {} failed: {other}",
                    job.source_provider
                )),
            })?;
            items.push(NewItem::for_job(job, document_id, document.digest()));
        }

        Ok(items)
    }

    /// `pending` to `running`.
    pub async fn start_job(&self, job_id: JobId) -> Result<MigrationJob> {
        let job = self
            .store
            .transition_job(job_id, &[JobStatus::Pending], JobStatus::Running)
            .await?;
        info!(target: "migration::manager", job_id = %job_id, total = job.total_documents, "migration job started");
        Ok(job)
    }

    /// `running` to `paused`; claimed items still finish.
    pub async fn pause_job(&self, job_id: JobId) -> Result<MigrationJob> {
        let job = self
            .store
            .transition_job(job_id, &[JobStatus::Running], JobStatus::Paused)
            .await?;
        info!(target: "migration::manager", job_id = %job_id, "migration job paused");
        Ok(job)
    }

    /// `paused` to `running`.
    pub async fn resume_job(&self, job_id: JobId) -> Result<MigrationJob> {
        self.store
            .transition_job(job_id, &[JobStatus::Paused], JobStatus::Running)
            .await?;
        // Claims that drained while paused may have finished the job.
        if let Some(settled) = self.store.settle_job(job_id).await? {
            info!(target: "migration::manager", job_id = %job_id, status = %settled, "job settled on resume");
        }
        info!(target: "migration::manager", job_id = %job_id, "migration job resumed");
        self.store.get_job(job_id).await
    }

    /// Completed items stay completed; pending items become skipped and
    /// in-flight claims finish on their own.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<MigrationJob> {
        let job = self.store.cancel_job(job_id).await?;
        info!(
            target: "migration::manager",
            job_id = %job_id,
            migrated = job.migrated_documents,
            skipped = job.skipped_documents,
            "migration job cancelled"
        );
        Ok(job)
    }

    /// Put every failed item of a `failed`/`partial` job back in the queue
    /// with a fresh attempt budget.
    pub async fn retry_failed(&self, job_id: JobId) -> Result<u64> {
        let requeued = self.store.requeue_failed(job_id).await?;
        if requeued == 0 {
            warn!(target: "migration::manager", job_id = %job_id, "retry found no failed items");
            self.store.settle_job(job_id).await?;
        }
        info!(target: "migration::manager", job_id = %job_id, requeued, "failed items requeued");
        Ok(requeued)
    }

    /// Fetch one job.
    pub async fn get_job(&self, job_id: JobId) -> Result<MigrationJob> {
        self.store.get_job(job_id).await
    }

    /// Jobs newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<MigrationJob>> {
        self.store.list_jobs(status).await
    }

    /// Items of a job in queue order.
    pub async fn list_items(&self, job_id: JobId, filter: ItemFilter) -> Result<Vec<MigrationItem>> {
        self.store.get_job(job_id).await?;
        self.store.list_items(job_id, filter).await
    }

    /// Progress snapshot derived from item state.
    pub async fn get_progress(&self, job_id: JobId) -> Result<Progress> {
        let job = self.store.get_job(job_id).await?;
        let counts = self.store.item_counts(job_id).await?;
        Ok(Progress::compute(&job, &counts, Utc::now()))
    }

    /// Compare job counters with item rows and outbox state.
    pub async fn verify_job(&self, job_id: JobId) -> Result<InvariantReport> {
        let job = self.store.get_job(job_id).await?;
        let counts = self.store.item_counts(job_id).await?;
        let unverified = self.store.unverified_completions(job_id).await?;
        let report = InvariantReport::evaluate(&job, counts, unverified);
        if !report.holds() {
            warn!(
                target: "migration::manager",
                job_id = %job_id,
                violations = ?report.violations,
                "job invariants violated"
            );
        }
        Ok(report)
    }
}

fn check_range(field: &str, value: u32, max: u32) -> Result<()> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(MigrationError::InvalidConfiguration(format!(
            "{field} must be between 1 and {max}, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryMigrationStore;
    use crate::provider::{InMemoryAdapter, ProviderKind};

    async fn manager() -> (MigrationManager, Arc<InMemoryAdapter>) {
        let store: Arc<dyn MigrationStore> = Arc::new(InMemoryMigrationStore::new());
        let manager = MigrationManager::new(store, ProviderRegistry::new(), EngineConfig::default());
        let source = Arc::new(InMemoryAdapter::new("source"));
        manager
            .register_provider(
                ProviderRegistration::new("source", ProviderKind::Memory),
                source.clone(),
            )
            .await
            .unwrap();
        manager
            .register_provider(
                ProviderRegistration::new("archive", ProviderKind::Memory).read_only(),
                Arc::new(InMemoryAdapter::new("archive")),
            )
            .await
            .unwrap();
        manager
            .register_provider(
                ProviderRegistration::new("dest", ProviderKind::Memory),
                Arc::new(InMemoryAdapter::new("dest")),
            )
            .await
            .unwrap();
        (manager, source)
    }

    #[tokio::test]
    async fn create_job_applies_defaults() {
        let (manager, _) = manager().await;
        let job = manager
            .create_job(CreateJobRequest::new("defaults", "source", "dest"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.strategy, Strategy::Copy);
        assert_eq!(job.concurrency, 5);
        assert_eq!(job.batch_size, 100);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.created_by, "system");
    }

    #[tokio::test]
    async fn create_job_rejects_bad_parameters() {
        let (manager, _) = manager().await;
        let cases = [
            CreateJobRequest::new("", "source", "dest"),
            CreateJobRequest::new("same", "source", "source"),
            CreateJobRequest::new("c", "source", "dest").concurrency(0),
            CreateJobRequest::new("c", "source", "dest").concurrency(65),
            CreateJobRequest::new("b", "source", "dest").batch_size(1_001),
            CreateJobRequest::new("a", "source", "dest").max_attempts(21),
        ];
        for request in cases {
            let err = manager.create_job(request).await.unwrap_err();
            assert!(
                matches!(err, MigrationError::InvalidConfiguration(_)),
                "unexpected {err:?}"
            );
        }
        assert!(manager.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_read_only_providers_are_rejected() {
        let (manager, _) = manager().await;
        let err = manager
            .create_job(CreateJobRequest::new("x", "source", "nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ProviderNotFound(_)));

        let err = manager
            .create_job(CreateJobRequest::new("x", "source", "archive"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ProviderUnwritable(_)));

        let err = manager
            .create_job(CreateJobRequest::new("x", "archive", "dest").strategy(Strategy::Move))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ProviderUnwritable(_)));

        // A dry-run copy never writes, so a read-only destination is fine.
        manager
            .create_job(CreateJobRequest::new("x", "source", "archive").dry_run(true))
            .await
            .expect("dry-run copy to read-only destination");
    }

    #[tokio::test]
    async fn missing_source_document_writes_nothing() {
        let (manager, source) = manager().await;
        source.insert("present", "body").await;
        let err = manager
            .create_job(CreateJobRequest::new("x", "source", "dest").documents(["present", "absent"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Transfer(msg) if msg.contains("absent")));
        assert!(manager.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn created_job_counts_every_selected_document() {
        let (manager, source) = manager().await;
        for id in ["a", "b", "c"] {
            source.insert(id, "body").await;
        }
        let job = manager
            .create_job(CreateJobRequest::new("x", "source", "dest").documents(["a", "b", "c", "a"]))
            .await
            .unwrap();
        assert_eq!(job.total_documents, 3);
        let items = manager.list_items(job.id, ItemFilter::default()).await.unwrap();
        assert_eq!(items.len(), 3);
        assert!(manager.verify_job(job.id).await.unwrap().holds());
    }

    #[tokio::test]
    async fn provider_names_with_slashes_are_rejected() {
        let (manager, _) = manager().await;
        let err = manager
            .register_provider(
                ProviderRegistration::new("team/docs", ProviderKind::Memory),
                Arc::new(InMemoryAdapter::new("team/docs")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidConfiguration(_)));
        assert!(manager.registry().resolve("team/docs").is_err());
    }

    #[tokio::test]
    async fn start_requires_pending() {
        let (manager, _) = manager().await;
        let job = manager
            .create_job(CreateJobRequest::new("x", "source", "dest"))
            .await
            .unwrap();
        manager.start_job(job.id).await.unwrap();
        let err = manager.start_job(job.id).await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidTransition(_)));

        manager.pause_job(job.id).await.unwrap();
        let resumed = manager.resume_job(job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (manager, _) = manager().await;
        let err = manager.get_progress(JobId::new()).await.unwrap_err();
        assert!(matches!(err, MigrationError::JobNotFound(_)));
    }
}
