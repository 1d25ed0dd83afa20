//! One claimed task, start to finish.
//!
//! The destination digest always comes from an independent re-fetch; the
//! digest returned by `put` is ignored. A `move` deletes the source only
//! after that check passes.

use tracing::{debug, trace};

use crate::digest::{self, ContentDigest};
use crate::error::{MigrationError, Result};
use crate::migration::job::Strategy;
use crate::migration::outbox::ClaimedTask;
use crate::provider::{ProviderRegistry, StorageError};

/// Skip reason recorded for every item of a dry-run job.
pub const DRY_RUN_REASON: &str = "dry run: source verified, nothing written";
/// Skip reason recorded when a mirror finds the document already in place.
pub const MIRROR_IDENTICAL_REASON: &str = "destination already holds identical content";

/// Result of a transfer that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Written and verified.
    Completed {
        /// Digest of the re-fetched destination copy.
        dest_digest: ContentDigest,
    },
    /// Deliberately not written.
    Skipped {
        /// Why nothing was written.
        reason: String,
    },
}

/// Read, check, write and verify one claimed document.
pub async fn execute(registry: &ProviderRegistry, task: &ClaimedTask) -> Result<TransferOutcome> {
    let payload = &task.payload;
    let source = registry.resolve(&payload.source_provider)?;
    let dest = registry.resolve(&payload.dest_provider)?;
    let expected = payload.source_digest;

    let document = match source.get(&payload.document_id).await {
        Ok(document) => document,
        Err(err) if err.is_not_found() && payload.strategy == Strategy::Move => {
            // An earlier attempt may have verified the copy and deleted the
            // source before its outcome was recorded.
            return match dest.get(&payload.dest_document_id).await {
                Ok(copy) if copy.digest() == expected => {
                    debug!(
                        target: "migration::worker",
                        document_id = %payload.document_id,
                        "move recovered from verified destination copy"
                    );
                    Ok(TransferOutcome::Completed {
                        dest_digest: expected,
                    })
                }
                _ => Err(MigrationError::Transfer(format!(
                    "source document {} is gone and {} holds no verified copy",
                    payload.document_id, payload.dest_provider
                ))),
            };
        }
        Err(err) => {
            return Err(MigrationError::Transfer(format!(
                "reading {} from {} failed: {err}",
                payload.document_id, payload.source_provider
            )));
        }
    };

    let current = document.digest();
    if current != expected {
        return Err(MigrationError::ContentMismatch {
            expected: expected.to_string(),
            actual: current.to_string(),
        });
    }

    if payload.dry_run {
        return Ok(TransferOutcome::Skipped {
            reason: DRY_RUN_REASON.to_string(),
        });
    }

    if payload.strategy == Strategy::Mirror
        && let Ok(existing) = dest.get(&payload.dest_document_id).await
        && existing.digest() == expected
    {
        return Ok(TransferOutcome::Skipped {
            reason: MIRROR_IDENTICAL_REASON.to_string(),
        });
    }

    dest.put(&payload.dest_document_id, &document.content, &document.metadata)
        .await
        .map_err(|e| match e {
            // The destination will reject this id on every attempt.
            StorageError::InvalidId { .. } => MigrationError::InvalidConfiguration(format!(
                "{} refuses document id {}: {e}",
                payload.dest_provider, payload.dest_document_id
            )),
            other => MigrationError::Transfer(format!(
                "writing {} to {} failed: {other}",
                payload.dest_document_id, payload.dest_provider
            )),
        })?;

    let copy = dest.get(&payload.dest_document_id).await.map_err(|e| {
        MigrationError::Transfer(format!(
            "re-fetching {} from {} failed: {e}",
            payload.dest_document_id, payload.dest_provider
        ))
    })?;
    let dest_digest =
        digest::validate(expected, &copy.content, document.content.len()).into_result()?;

    if payload.strategy == Strategy::Move {
        match source.delete(&payload.document_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return Err(MigrationError::Transfer(format!(
                    "deleting {} from {} after a verified copy failed: {err}",
                    payload.document_id, payload.source_provider
                )));
            }
        }
    }

    trace!(
        target: "migration::worker",
        document_id = %payload.document_id,
        bytes = document.content.len(),
        "transfer verified"
    );
    Ok(TransferOutcome::Completed { dest_digest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::migration::outbox::TaskPayload;
    use crate::provider::{
        InMemoryAdapter, LocalWorkspaceAdapter, ProviderKind, ProviderRegistration,
    };
    use crate::types::ids::{ItemId, JobId, OutboxId};

    fn setup() -> (ProviderRegistry, Arc<InMemoryAdapter>, Arc<InMemoryAdapter>) {
        let registry = ProviderRegistry::new();
        let source = Arc::new(InMemoryAdapter::new("src"));
        let dest = Arc::new(InMemoryAdapter::new("dst"));
        registry.register(ProviderRegistration::new("src", ProviderKind::Memory), source.clone());
        registry.register(ProviderRegistration::new("dst", ProviderKind::Memory), dest.clone());
        (registry, source, dest)
    }

    fn task(strategy: Strategy, body: &[u8], dry_run: bool) -> ClaimedTask {
        ClaimedTask {
            outbox_id: OutboxId::new(),
            worker_id: "w".into(),
            claimed_at: Utc::now(),
            attempt: 1,
            max_attempts: 3,
            payload: TaskPayload {
                job_id: JobId::new(),
                item_id: ItemId::new(),
                document_id: "doc".into(),
                dest_document_id: "doc".into(),
                source_provider: "src".into(),
                dest_provider: "dst".into(),
                strategy,
                source_digest: ContentDigest::of(body),
                dry_run,
            },
        }
    }

    #[tokio::test]
    async fn copy_writes_and_verifies() {
        let (registry, source, dest) = setup();
        source.insert("doc", "hello").await;
        let outcome = execute(&registry, &task(Strategy::Copy, b"hello", false))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                dest_digest: ContentDigest::of(b"hello")
            }
        );
        assert!(dest.contains("doc").await);
        assert!(source.contains("doc").await);
    }

    #[tokio::test]
    async fn source_changed_since_enqueue_is_a_mismatch() {
        let (registry, source, dest) = setup();
        source.insert("doc", "edited").await;
        let err = execute(&registry, &task(Strategy::Copy, b"original", false))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ContentMismatch { .. }));
        assert!(dest.is_empty().await);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let (registry, source, dest) = setup();
        source.insert("doc", "hello").await;
        let outcome = execute(&registry, &task(Strategy::Copy, b"hello", true))
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Skipped { .. }));
        assert!(dest.is_empty().await);
    }

    #[tokio::test]
    async fn mirror_skips_identical_destination() {
        let (registry, source, dest) = setup();
        source.insert("doc", "same").await;
        dest.insert("doc", "same").await;
        let outcome = execute(&registry, &task(Strategy::Mirror, b"same", false))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransferOutcome::Skipped {
                reason: MIRROR_IDENTICAL_REASON.to_string()
            }
        );
    }

    #[tokio::test]
    async fn move_deletes_source_after_verification() {
        let (registry, source, dest) = setup();
        source.insert("doc", "payload").await;
        execute(&registry, &task(Strategy::Move, b"payload", false))
            .await
            .unwrap();
        assert!(!source.contains("doc").await);
        assert!(dest.contains("doc").await);
    }

    #[tokio::test]
    async fn move_recovers_when_source_already_gone() {
        let (registry, _source, dest) = setup();
        dest.insert("doc", "payload").await;
        let outcome = execute(&registry, &task(Strategy::Move, b"payload", false))
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn rejected_destination_id_is_not_retryable() {
        let registry = ProviderRegistry::new();
        let source = Arc::new(InMemoryAdapter::new("src"));
        let root = tempfile::tempdir().unwrap();
        registry.register(ProviderRegistration::new("src", ProviderKind::Memory), source.clone());
        registry.register(
            ProviderRegistration::new("dst", ProviderKind::Local),
            Arc::new(LocalWorkspaceAdapter::new(root.path())),
        );
        source.insert("../escape", "body").await;

        let mut task = task(Strategy::Copy, b"body", false);
        task.payload.document_id = "../escape".into();
        task.payload.dest_document_id = "../escape".into();
        let err = execute(&registry, &task).await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidConfiguration(_)), "{err:?}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_provider_is_reported() {
        let registry = ProviderRegistry::new();
        let err = execute(&registry, &task(Strategy::Copy, b"x", false))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::ProviderNotFound(_)));
    }
}
