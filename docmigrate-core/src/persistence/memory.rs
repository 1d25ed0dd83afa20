//! In-memory [`MigrationStore`](super::MigrationStore).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{
    CANCELLED_ERROR, CLAIM_EXPIRED_ERROR, FailureDisposition, MigrationStore, NewItem, retry_at,
};
use crate::digest::ContentDigest;
use crate::error::{MigrationError, Result};
use crate::migration::config::RetryConfig;
use crate::migration::item::{ItemFilter, ItemStatus, MigrationItem};
use crate::migration::job::{JobStatus, MigrationJob};
use crate::migration::outbox::{
    ClaimedTask, EVENT_TASK_CREATED, IdempotencyKey, OutboxEntry, OutboxStatus,
};
use crate::migration::progress::ItemCounts;
use crate::provider::{ProviderRegistration, validate_provider_name};
use crate::types::ids::{ItemId, JobId, OutboxId};

#[derive(Default)]
struct State {
    providers: BTreeMap<String, ProviderRegistration>,
    jobs: HashMap<JobId, MigrationJob>,
    items: HashMap<ItemId, MigrationItem>,
    outbox: BTreeMap<OutboxId, OutboxEntry>,
    /// Live idempotency keys and the item holding each.
    keys: HashMap<String, ItemId>,
    /// Items whose key was handed to a later job.
    released: HashSet<ItemId>,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Result<&mut MigrationJob> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| MigrationError::JobNotFound(id.to_string()))
    }

    fn held_claim(&self, claim: &ClaimedTask) -> Result<()> {
        match self.outbox.get(&claim.outbox_id) {
            Some(entry)
                if entry.status == OutboxStatus::InFlight
                    && entry.claimed_by.as_deref() == Some(claim.worker_id.as_str())
                    && entry.claimed_at == Some(claim.claimed_at) =>
            {
                Ok(())
            }
            _ => Err(MigrationError::ClaimConflict(format!(
                "outbox entry {} is no longer held by {}",
                claim.outbox_id, claim.worker_id
            ))),
        }
    }

    /// Take `key` for `item_id`. An existing holder gives it up only when
    /// it ended skipped or failed inside a terminal job.
    fn claim_key(&mut self, key: &str, item_id: ItemId) -> bool {
        if let Some(&holder) = self.keys.get(key) {
            let releasable = self.items.get(&holder).is_some_and(|item| {
                matches!(item.status, ItemStatus::Skipped | ItemStatus::Failed)
                    && self
                        .jobs
                        .get(&item.job_id)
                        .is_some_and(|job| job.status.is_terminal())
            });
            if !releasable {
                return false;
            }

            let released = IdempotencyKey::released(key, holder);
            let now = Utc::now();
            if let Some(item) = self.items.get_mut(&holder) {
                item.idempotent_key = released.clone();
                item.updated_at = now;
            }
            for entry in self.outbox.values_mut().filter(|entry| entry.item_id == holder) {
                entry.idempotent_key = released.clone();
            }
            self.released.insert(holder);
            debug!(target: "migration::store", key, released_item = %holder, "idempotency key released to a new job");
        }
        self.keys.insert(key.to_string(), item_id);
        true
    }

    fn insert_items(&mut self, job: &MigrationJob, items: Vec<NewItem>) -> Result<u64> {
        let now = Utc::now();
        let mut inserted = 0u64;
        for item in items {
            if !self.claim_key(item.idempotent_key.as_str(), item.item_id) {
                trace!(target: "migration::store", key = %item.idempotent_key, "duplicate key ignored");
                continue;
            }

            self.items.insert(
                item.item_id,
                MigrationItem {
                    id: item.item_id,
                    job_id: job.id,
                    document_id: item.payload.document_id.clone(),
                    dest_document_id: item.payload.dest_document_id.clone(),
                    source_provider_id: job.source_provider_id,
                    dest_provider_id: job.dest_provider_id,
                    idempotent_key: item.idempotent_key.as_str().to_string(),
                    source_digest: item.payload.source_digest,
                    dest_digest: None,
                    status: ItemStatus::Pending,
                    attempt_count: 0,
                    max_attempts: job.max_attempts,
                    error_message: None,
                    content_match: None,
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    completed_at: None,
                    duration_ms: None,
                },
            );
            self.outbox.insert(
                item.outbox_id,
                OutboxEntry {
                    id: item.outbox_id,
                    job_id: job.id,
                    item_id: item.item_id,
                    idempotent_key: item.idempotent_key.into_inner(),
                    event_type: EVENT_TASK_CREATED.to_string(),
                    status: OutboxStatus::Pending,
                    payload: item.payload,
                    publish_attempts: 0,
                    claimed_by: None,
                    claimed_at: None,
                    available_at: now,
                    published_at: None,
                    last_error: None,
                    created_at: now,
                },
            );
            inserted += 1;
        }

        let stored = self.job_mut(job.id)?;
        stored.total_documents += inserted as i64;
        stored.updated_at = now;
        Ok(inserted)
    }

    fn counts(&self, id: JobId) -> ItemCounts {
        let mut counts = ItemCounts::default();
        for item in self.items.values().filter(|item| item.job_id == id) {
            counts.add(item.status, 1);
        }
        counts
    }

    /// Shared by worker-reported failures and expired claims.
    fn fail_attempt(
        &mut self,
        outbox_id: OutboxId,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition> {
        let now = Utc::now();
        let entry = self
            .outbox
            .get_mut(&outbox_id)
            .ok_or_else(|| MigrationError::Internal(format!("outbox entry {outbox_id} vanished")))?;
        let job_id = entry.job_id;
        let item_id = entry.item_id;

        let job_status = self
            .jobs
            .get(&job_id)
            .map(|job| job.status)
            .ok_or_else(|| MigrationError::JobNotFound(job_id.to_string()))?;
        let item = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| MigrationError::Internal(format!("item {item_id} vanished")))?;

        let disposition = match retry_after {
            _ if job_status == JobStatus::Cancelled => FailureDisposition::Skipped,
            Some(delay) if item.attempt_count < item.max_attempts => {
                FailureDisposition::Retrying {
                    available_at: retry_at(now, delay),
                }
            }
            _ => FailureDisposition::Failed,
        };

        item.error_message = Some(error.to_string());
        item.updated_at = now;
        entry.last_error = Some(error.to_string());
        entry.claimed_by = None;
        entry.claimed_at = None;

        match disposition {
            FailureDisposition::Retrying { available_at } => {
                item.status = ItemStatus::Pending;
                entry.status = OutboxStatus::Pending;
                entry.available_at = available_at;
            }
            FailureDisposition::Failed => {
                item.status = ItemStatus::Failed;
                item.completed_at = Some(now);
                entry.status = OutboxStatus::Failed;
            }
            FailureDisposition::Skipped => {
                item.status = ItemStatus::Skipped;
                item.completed_at = Some(now);
                entry.status = OutboxStatus::Failed;
            }
        }

        let job = self.job_mut(job_id)?;
        match disposition {
            FailureDisposition::Failed => job.failed_documents += 1,
            FailureDisposition::Skipped => job.skipped_documents += 1,
            FailureDisposition::Retrying { .. } => {}
        }
        job.updated_at = now;

        Ok(disposition)
    }
}

/// Single-process store with the same semantics as the Postgres store.
///
/// Every operation runs under one async mutex, which is what gives claims
/// their exclusivity here.
#[derive(Default)]
pub struct InMemoryMigrationStore {
    state: Mutex<State>,
}

impl fmt::Debug for InMemoryMigrationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryMigrationStore");
        if let Ok(state) = self.state.try_lock() {
            debug
                .field("jobs", &state.jobs.len())
                .field("items", &state.items.len())
                .field("outbox", &state.outbox.len());
        }
        debug.finish()
    }
}

impl InMemoryMigrationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn upsert_provider(
        &self,
        registration: &ProviderRegistration,
    ) -> Result<ProviderRegistration> {
        validate_provider_name(&registration.name)?;
        let mut state = self.state.lock().await;
        let stored = match state.providers.get(&registration.name) {
            // Keep the original id so existing jobs still reference it.
            Some(existing) => ProviderRegistration {
                id: existing.id,
                ..registration.clone()
            },
            None => registration.clone(),
        };
        state
            .providers
            .insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderRegistration>> {
        let state = self.state.lock().await;
        Ok(state.providers.values().cloned().collect())
    }

    async fn get_provider(&self, name: &str) -> Result<Option<ProviderRegistration>> {
        let state = self.state.lock().await;
        Ok(state.providers.get(name).cloned())
    }

    async fn create_job(&self, job: &MigrationJob, items: Vec<NewItem>) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        state.insert_items(job, items)
    }

    async fn get_job(&self, id: JobId) -> Result<MigrationJob> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| MigrationError::JobNotFound(id.to_string()))
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<MigrationJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<MigrationJob> = state
            .jobs
            .values()
            .filter(|job| status.is_none_or(|status| job.status == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }

    async fn queue_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| MigrationError::JobNotFound(job_id.to_string()))?;
        if !job.status.accepts_documents() {
            return Err(MigrationError::InvalidTransition(format!(
                "job {job_id} is {} and no longer accepts documents",
                job.status
            )));
        }

        state.insert_items(&job, items)
    }

    async fn transition_job(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<MigrationJob> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if !from.contains(&job.status) {
            return Err(MigrationError::InvalidTransition(format!(
                "job {id} cannot move from {} to {to}",
                job.status
            )));
        }

        let now = Utc::now();
        job.status = to;
        job.updated_at = now;
        if to == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(job.clone())
    }

    async fn cancel_job(&self, id: JobId) -> Result<MigrationJob> {
        let mut state = self.state.lock().await;
        let status = state.job_mut(id)?.status;
        if !matches!(
            status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused
        ) {
            return Err(MigrationError::InvalidTransition(format!(
                "job {id} cannot move from {status} to cancelled"
            )));
        }

        let now = Utc::now();
        let mut skipped = 0i64;
        let State { items, outbox, .. } = &mut *state;
        for entry in outbox
            .values_mut()
            .filter(|entry| entry.job_id == id && entry.status == OutboxStatus::Pending)
        {
            entry.status = OutboxStatus::Failed;
            entry.last_error = Some(CANCELLED_ERROR.to_string());
            if let Some(item) = items.get_mut(&entry.item_id) {
                item.status = ItemStatus::Skipped;
                item.error_message = Some(CANCELLED_ERROR.to_string());
                item.updated_at = now;
                item.completed_at = Some(now);
                skipped += 1;
            }
        }

        let job = state.job_mut(id)?;
        job.status = JobStatus::Cancelled;
        job.skipped_documents += skipped;
        job.updated_at = now;
        job.completed_at = Some(now);
        debug!(target: "migration::store", job_id = %id, skipped, "job cancelled");
        Ok(job.clone())
    }

    async fn requeue_failed(&self, id: JobId) -> Result<u64> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Partial) {
            return Err(MigrationError::InvalidTransition(format!(
                "job {id} is {}; only failed or partial jobs can be retried",
                job.status
            )));
        }
        let extra_attempts = job.max_attempts;

        let now = Utc::now();
        let mut requeued = 0u64;
        let State {
            items,
            outbox,
            released,
            ..
        } = &mut *state;
        for entry in outbox.values_mut().filter(|entry| entry.job_id == id) {
            let Some(item) = items.get_mut(&entry.item_id) else {
                continue;
            };
            if item.status != ItemStatus::Failed || released.contains(&item.id) {
                continue;
            }
            item.status = ItemStatus::Pending;
            item.max_attempts = item.attempt_count + extra_attempts;
            item.completed_at = None;
            item.updated_at = now;
            entry.status = OutboxStatus::Pending;
            entry.available_at = now;
            requeued += 1;
        }

        let job = state.job_mut(id)?;
        job.failed_documents -= requeued as i64;
        job.status = JobStatus::Running;
        job.completed_at = None;
        job.updated_at = now;
        Ok(requeued)
    }

    async fn claim_batch(&self, worker_id: &str, limit: u32) -> Result<Vec<ClaimedTask>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut running: Vec<&MigrationJob> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .collect();
        running.sort_by_key(|job| (job.started_at, job.created_at, job.id));

        let mut chosen = None;
        for job in running {
            let ready = state.outbox.values().any(|entry| {
                entry.job_id == job.id
                    && entry.status == OutboxStatus::Pending
                    && entry.available_at <= now
            });
            if !ready {
                continue;
            }
            let claimants: HashSet<&str> = state
                .outbox
                .values()
                .filter(|entry| entry.job_id == job.id && entry.status == OutboxStatus::InFlight)
                .filter_map(|entry| entry.claimed_by.as_deref())
                .collect();
            if !claimants.contains(worker_id) && claimants.len() >= job.concurrency as usize {
                continue;
            }
            chosen = Some((job.id, job.batch_size.min(limit).max(1)));
            break;
        }

        let Some((job_id, take)) = chosen else {
            return Ok(Vec::new());
        };

        let mut ready: Vec<(chrono::DateTime<Utc>, OutboxId)> = state
            .outbox
            .values()
            .filter(|entry| {
                entry.job_id == job_id
                    && entry.status == OutboxStatus::Pending
                    && entry.available_at <= now
            })
            .map(|entry| (entry.created_at, entry.id))
            .collect();
        ready.sort();
        ready.truncate(take as usize);

        let mut claims = Vec::with_capacity(ready.len());
        let State { items, outbox, .. } = &mut *state;
        for (_, outbox_id) in ready {
            let Some(entry) = outbox.get_mut(&outbox_id) else {
                continue;
            };
            let Some(item) = items.get_mut(&entry.item_id) else {
                continue;
            };
            entry.status = OutboxStatus::InFlight;
            entry.claimed_by = Some(worker_id.to_string());
            entry.claimed_at = Some(now);
            entry.publish_attempts += 1;

            item.status = ItemStatus::InProgress;
            item.attempt_count += 1;
            item.started_at = Some(now);
            item.updated_at = now;

            claims.push(ClaimedTask {
                outbox_id,
                worker_id: worker_id.to_string(),
                claimed_at: now,
                attempt: item.attempt_count,
                max_attempts: item.max_attempts,
                payload: entry.payload.clone(),
            });
        }

        if !claims.is_empty() {
            trace!(target: "migration::store", worker = worker_id, job_id = %job_id, claimed = claims.len(), "batch claimed");
        }
        Ok(claims)
    }

    async fn complete_item(
        &self,
        claim: &ClaimedTask,
        dest_digest: ContentDigest,
        duration_ms: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.held_claim(claim)?;
        let now = Utc::now();

        if let Some(entry) = state.outbox.get_mut(&claim.outbox_id) {
            entry.status = OutboxStatus::Published;
            entry.published_at = Some(now);
            entry.claimed_by = None;
            entry.claimed_at = None;
            entry.last_error = None;
        }
        if let Some(item) = state.items.get_mut(&claim.item_id()) {
            item.status = ItemStatus::Completed;
            item.dest_digest = Some(dest_digest);
            item.content_match = Some(dest_digest == item.source_digest);
            item.error_message = None;
            item.completed_at = Some(now);
            item.duration_ms = Some(duration_ms);
            item.updated_at = now;
        }
        let job = state.job_mut(claim.job_id())?;
        job.migrated_documents += 1;
        job.updated_at = now;
        Ok(())
    }

    async fn skip_item(&self, claim: &ClaimedTask, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.held_claim(claim)?;
        let now = Utc::now();

        if let Some(entry) = state.outbox.get_mut(&claim.outbox_id) {
            entry.status = OutboxStatus::Published;
            entry.published_at = Some(now);
            entry.claimed_by = None;
            entry.claimed_at = None;
        }
        if let Some(item) = state.items.get_mut(&claim.item_id()) {
            item.status = ItemStatus::Skipped;
            item.error_message = Some(reason.to_string());
            item.completed_at = Some(now);
            item.updated_at = now;
        }
        let job = state.job_mut(claim.job_id())?;
        job.skipped_documents += 1;
        job.updated_at = now;
        Ok(())
    }

    async fn record_failure(
        &self,
        claim: &ClaimedTask,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition> {
        let mut state = self.state.lock().await;
        state.held_claim(claim)?;
        state.fail_attempt(claim.outbox_id, error, retry_after)
    }

    async fn settle_job(&self, id: JobId) -> Result<Option<JobStatus>> {
        let mut state = self.state.lock().await;
        let counts = state.counts(id);
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running || job.total_documents == 0 || counts.outstanding() > 0
        {
            return Ok(None);
        }

        let settled = job.settled_status();
        let now = Utc::now();
        job.status = settled;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(Some(settled))
    }

    async fn release_expired_claims(
        &self,
        ttl: chrono::Duration,
        retry: &RetryConfig,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - ttl;
        let expired: Vec<(OutboxId, u32)> = state
            .outbox
            .values()
            .filter(|entry| {
                entry.status == OutboxStatus::InFlight
                    && entry.claimed_at.is_some_and(|at| at < cutoff)
            })
            .map(|entry| (entry.id, entry.publish_attempts))
            .collect();

        let mut released = 0u64;
        for (outbox_id, attempt) in expired {
            let delay = retry.delay_for_attempt(attempt);
            state.fail_attempt(outbox_id, CLAIM_EXPIRED_ERROR, Some(delay))?;
            released += 1;
        }
        Ok(released)
    }

    async fn item_counts(&self, id: JobId) -> Result<ItemCounts> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&id) {
            return Err(MigrationError::JobNotFound(id.to_string()));
        }
        Ok(state.counts(id))
    }

    async fn list_items(&self, id: JobId, filter: ItemFilter) -> Result<Vec<MigrationItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<MigrationItem> = state
            .items
            .values()
            .filter(|item| item.job_id == id)
            .filter(|item| filter.status.is_none_or(|status| item.status == status))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items.truncate(filter.effective_limit());
        Ok(items)
    }

    async fn list_outbox(&self, id: JobId) -> Result<Vec<OutboxEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|entry| entry.job_id == id)
            .cloned()
            .collect())
    }

    async fn unverified_completions(&self, id: JobId) -> Result<i64> {
        let state = self.state.lock().await;
        let published: HashSet<ItemId> = state
            .outbox
            .values()
            .filter(|entry| entry.job_id == id && entry.status == OutboxStatus::Published)
            .map(|entry| entry.item_id)
            .collect();
        Ok(state
            .items
            .values()
            .filter(|item| item.job_id == id && item.status == ItemStatus::Completed)
            .filter(|item| item.content_match != Some(true) || !published.contains(&item.id))
            .count() as i64)
    }
}
