#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docmigrate_core::persistence::{InMemoryMigrationStore, MigrationStore};
use docmigrate_core::provider::{
    DocumentMetadata, InMemoryAdapter, ProviderKind, ProviderRegistration, StorageAdapter,
    StorageError, StorageResult, StoredDocument,
};
use docmigrate_core::{
    ContentDigest, EngineConfig, JobId, JobStatus, MigrationJob, MigrationManager,
    ProviderRegistry, WorkerPool,
};

/// Adapter whose first `failures` writes are rejected.
#[derive(Debug)]
pub struct FlakyAdapter {
    inner: InMemoryAdapter,
    remaining: AtomicU32,
}

impl FlakyAdapter {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryAdapter::new("flaky"),
            remaining: AtomicU32::new(failures),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.contains(id).await
    }
}

#[async_trait]
impl StorageAdapter for FlakyAdapter {
    fn describe(&self) -> String {
        "flaky".into()
    }

    async fn get(&self, id: &str) -> StorageResult<StoredDocument> {
        self.inner.get(id).await
    }

    async fn put(
        &self,
        id: &str,
        content: &[u8],
        metadata: &DocumentMetadata,
    ) -> StorageResult<ContentDigest> {
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Backend("transient write failure".into()));
        }
        self.inner.put(id, content, metadata).await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.inner.delete(id).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

/// Adapter that silently stores a damaged body and reports the digest of
/// what it was given.
#[derive(Debug)]
pub struct CorruptingAdapter {
    inner: InMemoryAdapter,
}

impl CorruptingAdapter {
    pub fn new() -> Self {
        Self {
            inner: InMemoryAdapter::new("corrupting"),
        }
    }
}

#[async_trait]
impl StorageAdapter for CorruptingAdapter {
    fn describe(&self) -> String {
        "corrupting".into()
    }

    async fn get(&self, id: &str) -> StorageResult<StoredDocument> {
        self.inner.get(id).await
    }

    async fn put(
        &self,
        id: &str,
        content: &[u8],
        metadata: &DocumentMetadata,
    ) -> StorageResult<ContentDigest> {
        let mut damaged = content.to_vec();
        damaged.push(b'!');
        self.inner.put(id, &damaged, metadata).await?;
        Ok(ContentDigest::of(content))
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.inner.delete(id).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

/// Config tuned for tests: no backoff, fast polling.
pub fn fast_config(workers: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.workers = workers;
    config.worker.poll_interval_ms = 10;
    config.worker.housekeeper_interval_ms = 50;
    config.worker.worker_id_prefix = "test".into();
    config.retry.backoff_base_ms = 0;
    config.retry.backoff_max_ms = 0;
    config
}

pub struct Harness {
    pub store: Arc<dyn MigrationStore>,
    pub manager: MigrationManager,
    pub pool: WorkerPool,
    pub source: Arc<InMemoryAdapter>,
}

impl Harness {
    /// Manager and pool over an in-memory store with a seeded `source`
    /// provider and the given adapter registered as `dest`.
    pub async fn new(workers: usize, dest: Arc<dyn StorageAdapter>) -> Self {
        Self::with_config(fast_config(workers), dest).await
    }

    pub async fn with_config(config: EngineConfig, dest: Arc<dyn StorageAdapter>) -> Self {
        Self::with_store(Arc::new(InMemoryMigrationStore::new()), config, dest).await
    }

    pub async fn with_store(
        store: Arc<dyn MigrationStore>,
        config: EngineConfig,
        dest: Arc<dyn StorageAdapter>,
    ) -> Self {
        let registry = ProviderRegistry::new();
        let manager = MigrationManager::new(Arc::clone(&store), registry.clone(), config.clone());
        let pool = WorkerPool::new(Arc::clone(&store), registry, config);

        let source = Arc::new(InMemoryAdapter::new("source"));
        manager
            .register_provider(
                ProviderRegistration::new("source", ProviderKind::Memory),
                source.clone(),
            )
            .await
            .expect("register source");
        manager
            .register_provider(ProviderRegistration::new("dest", ProviderKind::Memory), dest)
            .await
            .expect("register dest");

        Self {
            store,
            manager,
            pool,
            source,
        }
    }

    pub async fn seed(&self, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for index in 0..count {
            let id = format!("docs/{index:03}.md");
            self.source
                .insert(id.clone(), format!("# document {index}\n").into_bytes())
                .await;
            ids.push(id);
        }
        ids
    }

    /// Drive claims on the calling task until the job settles.
    pub async fn drain(&self, job_id: JobId) -> MigrationJob {
        for _ in 0..100 {
            let job = self.manager.get_job(job_id).await.expect("job exists");
            if job.status.is_terminal() {
                return job;
            }
            self.pool.run_once("test-inline").await.expect("claim");
        }
        panic!("job {job_id} did not settle");
    }
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_terminal(manager: &MigrationManager, job_id: JobId) -> MigrationJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = manager.get_job(job_id).await.expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_status(job: &MigrationJob, status: JobStatus) {
    assert_eq!(job.status, status, "unexpected status for {}", job.job_name);
}
