//! Per-document item model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::digest::ContentDigest;
use crate::error::{MigrationError, Result};
use crate::types::ids::{ItemId, JobId, ProviderId};

/// Page size when a listing gives no limit.
pub const DEFAULT_ITEM_LIMIT: usize = 100;
/// Largest page a listing returns.
pub const MAX_ITEM_LIMIT: usize = 1_000;

/// Item lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for a claim or a retry.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Transferred and verified.
    Completed,
    /// Attempt budget spent or error not retryable.
    Failed,
    /// Not transferred: cancelled, dry run or already identical.
    Skipped,
}

impl ItemStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Pending,
        ItemStatus::InProgress,
        ItemStatus::Completed,
        ItemStatus::Failed,
        ItemStatus::Skipped,
    ];

    /// Persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }

    /// Inverse of [`ItemStatus::as_str`].
    pub fn parse(raw: &str) -> Result<Self> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| MigrationError::Internal(format!("unknown item status {raw:?}")))
    }

    /// Whether no worker will touch the item again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document inside one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationItem {
    /// Item id.
    pub id: ItemId,
    /// Owning job.
    pub job_id: JobId,
    /// Id on the source provider.
    pub document_id: String,
    /// Id written on the destination provider.
    pub dest_document_id: String,
    /// Source provider id at queue time.
    pub source_provider_id: ProviderId,
    /// Destination provider id at queue time.
    pub dest_provider_id: ProviderId,
    /// Deduplication key, see [`crate::migration::IdempotencyKey`].
    pub idempotent_key: String,
    /// Digest captured when the document was queued.
    pub source_digest: ContentDigest,
    /// Digest of the re-fetched destination copy.
    pub dest_digest: Option<ContentDigest>,
    /// Lifecycle state.
    pub status: ItemStatus,
    /// Claims handed out so far.
    pub attempt_count: u32,
    /// Attempt budget copied from the job.
    pub max_attempts: u32,
    /// Last failure or skip reason.
    pub error_message: Option<String>,
    /// Whether the destination read-back matched the source digest.
    pub content_match: Option<bool>,
    /// Queue time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Most recent claim.
    pub started_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time of the final attempt.
    pub duration_ms: Option<i64>,
}

/// Item listing filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFilter {
    /// Only items in this status.
    pub status: Option<ItemStatus>,
    /// Page size, see [`ItemFilter::effective_limit`].
    pub limit: Option<usize>,
}

impl ItemFilter {
    /// Filter on `status` with the default limit.
    pub fn with_status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    /// Requested limit clamped to `1..=1000`, defaulting to 100.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_ITEM_LIMIT)
            .clamp(1, MAX_ITEM_LIMIT)
    }
}
