//! Durable state for jobs, items and the outbox.
//!
//! [`MigrationStore`] is the only place job/item/outbox rows change. Every
//! method is one transaction; counters move through single-row increments and
//! claims are exclusive across executors in any number of processes.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::digest::ContentDigest;
use crate::error::Result;
use crate::migration::config::RetryConfig;
use crate::migration::item::{ItemFilter, MigrationItem};
use crate::migration::job::{JobStatus, MigrationJob};
use crate::migration::outbox::{ClaimedTask, IdempotencyKey, OutboxEntry, TaskPayload};
use crate::migration::progress::ItemCounts;
use crate::provider::ProviderRegistration;
use crate::types::ids::{ItemId, JobId, OutboxId};

pub use memory::InMemoryMigrationStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresMigrationStore;

/// Error recorded on items whose job was cancelled before they ran.
pub const CANCELLED_ERROR: &str = "job cancelled";
/// Error recorded when a claim outlives the claim TTL.
pub const CLAIM_EXPIRED_ERROR: &str = "claim expired before the worker reported an outcome";

/// A document ready to be written as item + outbox entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewItem {
    /// Id of the item row.
    pub item_id: ItemId,
    /// Id of the outbox row.
    pub outbox_id: OutboxId,
    /// Shared by both rows.
    pub idempotent_key: IdempotencyKey,
    /// Task stored on the outbox row.
    pub payload: TaskPayload,
}

impl NewItem {
    /// Item for `document_id` on the job's route with the digest captured
    /// at enqueue time.
    pub fn for_job(job: &MigrationJob, document_id: &str, digest: ContentDigest) -> Self {
        let item_id = ItemId::new();
        Self {
            item_id,
            outbox_id: OutboxId::new(),
            idempotent_key: IdempotencyKey::derive(
                &job.source_provider,
                &job.dest_provider,
                document_id,
                &digest,
                job.dry_run,
            ),
            payload: TaskPayload {
                job_id: job.id,
                item_id,
                document_id: document_id.to_string(),
                dest_document_id: document_id.to_string(),
                source_provider: job.source_provider.clone(),
                dest_provider: job.dest_provider.clone(),
                strategy: job.strategy,
                source_digest: digest,
                dry_run: job.dry_run,
            },
        }
    }
}

/// What happened to an item after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to pending.
    Retrying {
        /// Earliest time the entry can be claimed again.
        available_at: DateTime<Utc>,
    },
    /// Attempt budget exhausted, or the error was not retryable.
    Failed,
    /// The job was cancelled while the attempt ran.
    Skipped,
}

impl FailureDisposition {
    /// Whether the item left the queue for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FailureDisposition::Retrying { .. })
    }
}

pub(crate) fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[async_trait]
pub trait MigrationStore: Send + Sync + 'static {
    /// Insert or update a registration by name; returns the stored row.
    async fn upsert_provider(
        &self,
        registration: &ProviderRegistration,
    ) -> Result<ProviderRegistration>;

    /// All registrations ordered by name.
    async fn list_providers(&self) -> Result<Vec<ProviderRegistration>>;

    /// Registration by name, active or not.
    async fn get_provider(&self, name: &str) -> Result<Option<ProviderRegistration>>;

    /// Insert the job together with its initial items and outbox entries in
    /// one transaction. Returns how many items were inserted, with the same
    /// key rules as [`MigrationStore::queue_items`].
    async fn create_job(&self, job: &MigrationJob, items: Vec<NewItem>) -> Result<u64>;

    /// `JobNotFound` when missing.
    async fn get_job(&self, id: JobId) -> Result<MigrationJob>;

    /// Newest first.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<MigrationJob>>;

    /// Write each item with its outbox entry. Items whose idempotency key
    /// already exists are skipped, unless the existing item ended skipped or
    /// failed in a terminal job: that row is released and the key moves to
    /// the new item. Returns how many were inserted and bumps
    /// `total_documents` by the same amount.
    async fn queue_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<u64>;

    /// Move the job to `to` if it is currently in one of `from`, else
    /// `InvalidTransition`.
    async fn transition_job(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<MigrationJob>;

    /// Cancel the job and turn its pending items into skipped ones.
    async fn cancel_job(&self, id: JobId) -> Result<MigrationJob>;

    /// Return failed items of a `failed`/`partial` job to pending and the job
    /// to `running`. Items whose key was released to a later job stay
    /// failed. Returns the number of items requeued.
    async fn requeue_failed(&self, id: JobId) -> Result<u64>;

    /// Claim up to `limit` ready entries from the oldest running job that
    /// still has executor capacity.
    async fn claim_batch(&self, worker_id: &str, limit: u32) -> Result<Vec<ClaimedTask>>;

    /// `ClaimConflict` when the claim is no longer held.
    async fn complete_item(
        &self,
        claim: &ClaimedTask,
        dest_digest: ContentDigest,
        duration_ms: i64,
    ) -> Result<()>;

    /// Publish the entry and mark the item skipped with `reason`.
    async fn skip_item(&self, claim: &ClaimedTask, reason: &str) -> Result<()>;

    /// Record a failed attempt. With `retry_after` set and budget left the
    /// item returns to pending; `None` fails it outright. A cancelled job
    /// turns the item skipped either way.
    async fn record_failure(
        &self,
        claim: &ClaimedTask,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition>;

    /// Settle a running job with no outstanding items. Returns the new
    /// status when it changed.
    async fn settle_job(&self, id: JobId) -> Result<Option<JobStatus>>;

    /// Push claims older than `ttl` through the failure path.
    async fn release_expired_claims(
        &self,
        ttl: chrono::Duration,
        retry: &RetryConfig,
    ) -> Result<u64>;

    /// Item counts by status; `JobNotFound` when the job is missing.
    async fn item_counts(&self, id: JobId) -> Result<ItemCounts>;

    /// Items in insertion order.
    async fn list_items(&self, id: JobId, filter: ItemFilter) -> Result<Vec<MigrationItem>>;

    /// Outbox entries in insertion order.
    async fn list_outbox(&self, id: JobId) -> Result<Vec<OutboxEntry>>;

    /// Completed items without a published outbox entry or a positive
    /// content match.
    async fn unverified_completions(&self, id: JobId) -> Result<i64>;
}
