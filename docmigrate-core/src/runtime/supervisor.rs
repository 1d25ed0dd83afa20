//! Worker pool supervision.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::transfer::{self, TransferOutcome};
use crate::error::{MigrationError, Result};
use crate::migration::config::EngineConfig;
use crate::migration::job::JobStatus;
use crate::migration::outbox::ClaimedTask;
use crate::persistence::{FailureDisposition, MigrationStore};
use crate::provider::{AdapterFactory, ProviderRegistry};
use crate::types::ids::JobId;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Executors draining the outbox, plus the claim housekeeper.
///
/// Executors share nothing but the store and registry handles; every
/// coordination decision is made by the store's claim query. With an
/// adapter factory the registry also follows registrations persisted by
/// other processes.
pub struct WorkerPool {
    store: Arc<dyn MigrationStore>,
    registry: ProviderRegistry,
    config: EngineConfig,
    adapter_factory: Option<Arc<dyn AdapterFactory>>,
    pool_id: String,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("WorkerPool")
            .field("pool_id", &self.pool_id)
            .field("workers", &self.config.worker.workers)
            .field("refreshes_registry", &self.adapter_factory.is_some())
            .field("handles", &handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    /// Pool over `store`; executors resolve adapters through `registry`.
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: ProviderRegistry,
        config: EngineConfig,
    ) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let pool_id = format!(
            "{}-{}-{}",
            config.worker.worker_id_prefix,
            std::process::id(),
            &short[..8]
        );
        Self {
            store,
            registry,
            config,
            adapter_factory: None,
            pool_id,
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the registry from persisted registrations on every
    /// housekeeper tick and whenever a task names an unknown provider.
    pub fn with_adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.adapter_factory = Some(factory);
        self
    }

    /// Identity prefix of this pool's executors.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Spawn the executors and the housekeeper. Cancelling `shutdown` has
    /// the same effect as calling [`WorkerPool::shutdown`] minus the join.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(MigrationError::Cancelled(format!(
                "worker pool {} was already shut down",
                self.pool_id
            )));
        }
        if self.config.worker.workers == 0 {
            return Err(MigrationError::InvalidConfiguration(
                "worker pool needs at least one worker".into(),
            ));
        }

        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() {
            return Err(MigrationError::InvalidTransition(format!(
                "worker pool {} is already running",
                self.pool_id
            )));
        }

        let own = self.shutdown_token.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => own.cancel(),
                _ = own.cancelled() => {}
            }
        }));

        for index in 0..self.config.worker.workers {
            let executor = self.executor(format!("{}-w{index}", self.pool_id));
            let shutdown = self.shutdown_token.clone();
            let poll_interval = self.config.worker.poll_interval();
            handles.push(tokio::spawn(async move {
                executor.run(shutdown, poll_interval).await;
            }));
        }
        handles.push(self.spawn_housekeeper());

        info!(
            target: "migration::worker",
            pool = %self.pool_id,
            workers = self.config.worker.workers,
            poll_interval_ms = self.config.worker.poll_interval_ms,
            "worker pool started"
        );
        Ok(())
    }

    /// Claim and process at most one batch on the caller's task. Returns how
    /// many tasks were claimed.
    pub async fn run_once(&self, worker_id: &str) -> Result<usize> {
        self.executor(worker_id.to_string()).run_once().await
    }

    /// Signal every task to stop and wait for in-flight batches to finish.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "migration::worker", pool = %self.pool_id, "worker pool shutting down");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "migration::worker", "worker task failed: {e:?}"),
                Err(_) => warn!(target: "migration::worker", "worker task timed out during shutdown"),
            }
        }

        info!(target: "migration::worker", pool = %self.pool_id, "worker pool stopped");
        Ok(())
    }

    fn executor(&self, worker_id: String) -> Executor {
        Executor {
            worker_id,
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            config: self.config.clone(),
            adapter_factory: self.adapter_factory.clone(),
        }
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let registry = self.registry.clone();
        let factory = self.adapter_factory.clone();
        let interval = self.config.worker.housekeeper_interval();
        let ttl = self.config.worker.claim_ttl();
        let retry = self.config.retry.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "migration::worker", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.release_expired_claims(ttl, &retry).await {
                            Ok(0) => {}
                            Ok(released) => {
                                info!(target: "migration::worker", released, "released expired claims");
                                settle_running_jobs(store.as_ref()).await;
                            }
                            Err(err) => {
                                warn!(target: "migration::worker", error = %err, "expired claim sweep failed");
                            }
                        }
                        if let Some(factory) = factory.as_deref()
                            && let Err(err) = refresh_registry(store.as_ref(), &registry, factory).await
                        {
                            warn!(target: "migration::worker", error = %err, "provider registry refresh failed");
                        }
                    }
                }
            }
        })
    }
}

async fn refresh_registry(
    store: &dyn MigrationStore,
    registry: &ProviderRegistry,
    factory: &dyn AdapterFactory,
) -> Result<usize> {
    let registrations = store.list_providers().await?;
    Ok(registry.refresh(registrations, factory))
}

/// Released claims can be the last outstanding work of a job.
async fn settle_running_jobs(store: &dyn MigrationStore) {
    let jobs = match store.list_jobs(Some(JobStatus::Running)).await {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(target: "migration::worker", error = %err, "listing running jobs failed");
            return;
        }
    };
    for job in jobs {
        if let Err(err) = store.settle_job(job.id).await {
            warn!(target: "migration::worker", job_id = %job.id, error = %err, "settling job failed");
        }
    }
}

struct Executor {
    worker_id: String,
    store: Arc<dyn MigrationStore>,
    registry: ProviderRegistry,
    config: EngineConfig,
    adapter_factory: Option<Arc<dyn AdapterFactory>>,
}

impl Executor {
    async fn run(self, shutdown: CancellationToken, poll_interval: Duration) {
        loop {
            // Cancellation is only observed between batches, never mid-transfer.
            if shutdown.is_cancelled() {
                debug!(target: "migration::worker", worker = %self.worker_id, "executor shutting down");
                break;
            }

            let idle = match self.run_once().await {
                Ok(0) => true,
                Ok(_) => false,
                Err(err) => {
                    warn!(target: "migration::worker", worker = %self.worker_id, error = %err, "claim failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    async fn run_once(&self) -> Result<usize> {
        let tasks = self
            .store
            .claim_batch(&self.worker_id, self.config.worker.claim_batch_limit)
            .await?;
        let claimed = tasks.len();
        let ttl = self.config.worker.claim_ttl();
        for (index, task) in tasks.into_iter().enumerate() {
            // Claims this old may already be reaped and handed to another
            // executor; the housekeeper returns the rest of the batch.
            if task.is_stale(ttl, Utc::now()) {
                debug!(
                    target: "migration::worker",
                    worker = %self.worker_id,
                    abandoned = claimed - index,
                    "claim expired before processing; leaving batch to the housekeeper"
                );
                break;
            }
            self.process(task).await;
        }
        Ok(claimed)
    }

    async fn process(&self, task: ClaimedTask) {
        let started = Instant::now();
        let job_id = task.job_id();
        let outcome = match transfer::execute(&self.registry, &task).await {
            Err(MigrationError::ProviderNotFound(name)) => self.retry_after_refresh(&task, name).await,
            other => other,
        };
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let recorded = match outcome {
            Ok(TransferOutcome::Completed { dest_digest }) => self
                .store
                .complete_item(&task, dest_digest, duration_ms)
                .await
                .map(|()| {
                    debug!(
                        target: "migration::worker",
                        worker = %self.worker_id,
                        job_id = %job_id,
                        document_id = %task.payload.document_id,
                        attempt = task.attempt,
                        duration_ms,
                        "item migrated"
                    );
                    true
                }),
            Ok(TransferOutcome::Skipped { reason }) => {
                self.store.skip_item(&task, &reason).await.map(|()| {
                    debug!(
                        target: "migration::worker",
                        worker = %self.worker_id,
                        job_id = %job_id,
                        document_id = %task.payload.document_id,
                        reason = %reason,
                        "item skipped"
                    );
                    true
                })
            }
            Err(err) => {
                let retry_after = err
                    .is_retryable()
                    .then(|| self.config.retry.delay_for_attempt(task.attempt));
                let message = err.to_string();
                self.store
                    .record_failure(&task, &message, retry_after)
                    .await
                    .map(|disposition| {
                        match disposition {
                            FailureDisposition::Retrying { available_at } => debug!(
                                target: "migration::worker",
                                worker = %self.worker_id,
                                job_id = %job_id,
                                document_id = %task.payload.document_id,
                                attempt = task.attempt,
                                max_attempts = task.max_attempts,
                                retry_at = %available_at,
                                error = %message,
                                "transfer attempt failed; will retry"
                            ),
                            FailureDisposition::Failed => warn!(
                                target: "migration::worker",
                                worker = %self.worker_id,
                                job_id = %job_id,
                                document_id = %task.payload.document_id,
                                attempts = task.attempt,
                                retryable = retry_after.is_some(),
                                error = %message,
                                "item failed"
                            ),
                            FailureDisposition::Skipped => debug!(
                                target: "migration::worker",
                                job_id = %job_id,
                                document_id = %task.payload.document_id,
                                "failed attempt of cancelled job recorded as skipped"
                            ),
                        }
                        disposition.is_terminal()
                    })
            }
        };

        match recorded {
            Ok(true) => self.settle(job_id).await,
            Ok(false) => {}
            Err(MigrationError::ClaimConflict(reason)) => {
                trace!(target: "migration::worker", worker = %self.worker_id, %reason, "claim conflict absorbed");
            }
            Err(err) => {
                warn!(
                    target: "migration::worker",
                    worker = %self.worker_id,
                    job_id = %job_id,
                    error = %err,
                    "recording item outcome failed"
                );
            }
        }
    }

    /// Registrations may have been added or changed by another process since
    /// the registry was last built.
    async fn retry_after_refresh(
        &self,
        task: &ClaimedTask,
        provider: String,
    ) -> Result<TransferOutcome> {
        let Some(factory) = self.adapter_factory.as_deref() else {
            return Err(MigrationError::ProviderNotFound(provider));
        };
        let providers = refresh_registry(self.store.as_ref(), &self.registry, factory).await?;
        debug!(
            target: "migration::worker",
            worker = %self.worker_id,
            provider = %provider,
            providers,
            "registry refreshed after unknown provider"
        );
        transfer::execute(&self.registry, task).await
    }

    async fn settle(&self, job_id: JobId) {
        match self.store.settle_job(job_id).await {
            Ok(Some(status)) => {
                info!(target: "migration::worker", job_id = %job_id, status = %status, "migration job settled");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "migration::worker", job_id = %job_id, error = %err, "settling job failed");
            }
        }
    }
}
