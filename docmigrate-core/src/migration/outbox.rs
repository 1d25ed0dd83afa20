//! Outbox entries: the durable work records workers claim.
//!
//! Each entry is written in the same transaction as its migration item and
//! shares its idempotency key. The key is unique across the whole outbox, so
//! queueing identical content twice is a no-op, while changed content (a new
//! digest) produces a new entry rather than mutating an old one. Dry runs
//! live in their own key namespace, and a key whose item ended skipped or
//! failed inside a finished job is released to the next job that queues it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::job::Strategy;
use crate::digest::ContentDigest;
use crate::error::{MigrationError, Result};
use crate::types::ids::{ItemId, JobId, OutboxId};

/// Event type stamped on every entry written by the manager.
pub const EVENT_TASK_CREATED: &str = "migration.task.created";

/// Delivery state of an outbox entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be claimed once `available_at` has passed.
    Pending,
    /// Claimed by an executor.
    InFlight,
    /// The item reached completed or skipped.
    Published,
    /// The item failed or its job was cancelled.
    Failed,
}

impl OutboxStatus {
    /// Persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    /// Inverse of [`OutboxStatus::as_str`].
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(OutboxStatus::Pending),
            "in_flight" => Ok(OutboxStatus::InFlight),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(MigrationError::Internal(format!(
                "unknown outbox status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const LIVE_NAMESPACE: &str = "live";
const DRY_RUN_NAMESPACE: &str = "dry-run";

/// Deterministic key for one document route and one body.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// `{live|dry-run}:{source}/{dest}/{document_id}@sha256:{hex}`
    ///
    /// Provider names never contain `/` (see
    /// [`validate_provider_name`](crate::provider::validate_provider_name)),
    /// so the first two separators always delimit the route.
    pub fn derive(
        source_provider: &str,
        dest_provider: &str,
        document_id: &str,
        digest: &ContentDigest,
        dry_run: bool,
    ) -> Self {
        let namespace = if dry_run {
            DRY_RUN_NAMESPACE
        } else {
            LIVE_NAMESPACE
        };
        Self(format!(
            "{namespace}:{source_provider}/{dest_provider}/{document_id}@{digest}"
        ))
    }

    /// Key text as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the stored text.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Stored form of a key handed over to a later job. The suffix keeps
    /// the released row unique without colliding with live keys, which
    /// always end in a digest.
    pub fn released(key: &str, item_id: ItemId) -> String {
        format!("{key}#released:{item_id}")
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything an executor needs to carry out one transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Owning job.
    pub job_id: JobId,
    /// Item this task reports its outcome on.
    pub item_id: ItemId,
    /// Id on the source provider.
    pub document_id: String,
    /// Id on the destination provider.
    pub dest_document_id: String,
    /// Source provider name.
    pub source_provider: String,
    /// Destination provider name.
    pub dest_provider: String,
    /// Copy, move or mirror.
    pub strategy: Strategy,
    /// Digest captured when the document was queued.
    pub source_digest: ContentDigest,
    /// Read and verify the source only.
    pub dry_run: bool,
}

/// Persisted outbox row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Entry id.
    pub id: OutboxId,
    /// Owning job.
    pub job_id: JobId,
    /// Item written in the same transaction.
    pub item_id: ItemId,
    /// Shared with the item.
    pub idempotent_key: String,
    /// Always [`EVENT_TASK_CREATED`] for entries written by the manager.
    pub event_type: String,
    /// Delivery state.
    pub status: OutboxStatus,
    /// Task handed to the claiming executor.
    pub payload: TaskPayload,
    /// Number of times the entry has been claimed.
    pub publish_attempts: u32,
    /// Current claimant, while in flight.
    pub claimed_by: Option<String>,
    /// Claim time, while in flight.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest time the entry may be claimed.
    pub available_at: DateTime<Utc>,
    /// When the entry was published.
    pub published_at: Option<DateTime<Utc>>,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Insertion time; claims within a job follow it.
    pub created_at: DateTime<Utc>,
}

/// An outbox entry owned by one executor until it reports an outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedTask {
    /// Claimed entry.
    pub outbox_id: OutboxId,
    /// Executor holding the claim.
    pub worker_id: String,
    /// Claim time; together with `worker_id` it identifies the claim.
    pub claimed_at: DateTime<Utc>,
    /// Attempt number this claim represents (1-based).
    pub attempt: u32,
    /// Attempt budget of the item at claim time.
    pub max_attempts: u32,
    /// Task to carry out.
    pub payload: TaskPayload,
}

impl ClaimedTask {
    /// Owning job.
    pub fn job_id(&self) -> JobId {
        self.payload.job_id
    }

    /// Item the outcome is recorded on.
    pub fn item_id(&self) -> ItemId {
        self.payload.item_id
    }

    /// Whether the claim has outlived `ttl` and may already have been
    /// released to another executor.
    pub fn is_stale(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.claimed_at >= ttl
    }
}
