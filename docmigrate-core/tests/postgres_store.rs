#![cfg(feature = "postgres")]

mod support;

use std::sync::Arc;

use docmigrate_core::migration::{ItemFilter, ItemStatus, OutboxStatus};
use docmigrate_core::persistence::{MigrationStore, PostgresMigrationStore};
use docmigrate_core::provider::InMemoryAdapter;
use docmigrate_core::{CreateJobRequest, JobStatus, MigrationError};
use sqlx::{PgPool, Row};

use support::{FlakyAdapter, Harness, assert_status, fast_config};

async fn harness(pool: PgPool, dest: Arc<dyn docmigrate_core::StorageAdapter>) -> Harness {
    let store: Arc<dyn MigrationStore> = Arc::new(
        PostgresMigrationStore::new(pool)
            .await
            .expect("store connects"),
    );
    Harness::with_store(store, fast_config(2), dest).await
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn schema_has_outbox_tables(pool: PgPool) -> Result<(), sqlx::Error> {
    for table in [
        "provider_storage",
        "migration_jobs",
        "migration_items",
        "migration_outbox",
    ] {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_name = $1
            )",
        )
        .bind(table)
        .fetch_one(&pool)
        .await?;
        let exists: bool = row.get(0);
        assert!(exists, "{table} should exist");
    }
    Ok(())
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn idempotency_key_is_unique(pool: PgPool) {
    let harness = harness(pool.clone(), Arc::new(InMemoryAdapter::new("dest"))).await;
    let ids = harness.seed(2).await;

    let job = harness
        .manager
        .create_job(CreateJobRequest::new("dupes", "source", "dest").documents(ids.clone()))
        .await
        .unwrap();
    assert_eq!(harness.manager.queue_documents(job.id, &ids).await.unwrap(), 0);

    let items: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM migration_items WHERE migration_job_id = $1")
            .bind(job.id.as_uuid())
            .fetch_one(&pool)
            .await
            .unwrap();
    let entries: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM migration_outbox WHERE migration_job_id = $1")
            .bind(job.id.as_uuid())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(items, 2);
    assert_eq!(entries, 2);
    assert_eq!(harness.manager.get_job(job.id).await.unwrap().total_documents, 2);
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_claims_never_overlap(pool: PgPool) {
    let harness = harness(pool, Arc::new(InMemoryAdapter::new("dest"))).await;
    let ids = harness.seed(20).await;

    let job = harness
        .manager
        .create_job(
            CreateJobRequest::new("claims", "source", "dest")
                .documents(ids)
                .concurrency(4)
                .batch_size(5),
        )
        .await
        .unwrap();
    harness.manager.start_job(job.id).await.unwrap();

    let claims = futures::future::join_all(
        (0..4).map(|i| {
            let store = Arc::clone(&harness.store);
            async move { store.claim_batch(&format!("worker-{i}"), 10).await }
        }),
    )
    .await;

    let mut seen = std::collections::HashSet::new();
    let mut total = 0;
    for batch in claims {
        for task in batch.unwrap() {
            assert!(seen.insert(task.outbox_id), "outbox entry claimed twice");
            total += 1;
        }
    }
    assert!(total > 0 && total <= 20);

    let settled = harness.drain(job.id).await;
    assert_status(&settled, JobStatus::Completed);
    assert_eq!(settled.migrated_documents, 20);
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn retries_then_completes_against_postgres(pool: PgPool) {
    let dest = Arc::new(FlakyAdapter::new(2));
    let harness = harness(pool, dest.clone()).await;
    let ids = harness.seed(1).await;

    let job = harness
        .manager
        .create_job(
            CreateJobRequest::new("flaky", "source", "dest")
                .documents(ids.clone())
                .max_attempts(3),
        )
        .await
        .unwrap();
    harness.manager.start_job(job.id).await.unwrap();

    let settled = harness.drain(job.id).await;
    assert_status(&settled, JobStatus::Completed);
    assert!(dest.contains(&ids[0]).await);

    let items = harness
        .manager
        .list_items(job.id, ItemFilter::default())
        .await
        .unwrap();
    assert_eq!(items[0].attempt_count, 3);
    assert_eq!(items[0].content_match, Some(true));
    assert!(harness.manager.verify_job(job.id).await.unwrap().holds());
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn cancel_and_stale_claims(pool: PgPool) {
    let harness = harness(pool, Arc::new(InMemoryAdapter::new("dest"))).await;
    let ids = harness.seed(3).await;

    let job = harness
        .manager
        .create_job(
            CreateJobRequest::new("cancel", "source", "dest")
                .documents(ids)
                .batch_size(1),
        )
        .await
        .unwrap();
    harness.manager.start_job(job.id).await.unwrap();

    let claims = harness.store.claim_batch("worker-a", 10).await.unwrap();
    assert_eq!(claims.len(), 1);

    let cancelled = harness.manager.cancel_job(job.id).await.unwrap();
    assert_status(&cancelled, JobStatus::Cancelled);
    assert_eq!(cancelled.skipped_documents, 2);

    // The running claim fails after cancellation and is recorded as skipped.
    let disposition = harness
        .store
        .record_failure(&claims[0], "boom", Some(std::time::Duration::ZERO))
        .await
        .unwrap();
    assert!(disposition.is_terminal());

    let again = harness
        .store
        .record_failure(&claims[0], "boom", Some(std::time::Duration::ZERO))
        .await;
    assert!(matches!(again, Err(MigrationError::ClaimConflict(_))));

    let skipped = harness
        .manager
        .list_items(job.id, ItemFilter::with_status(ItemStatus::Skipped))
        .await
        .unwrap();
    assert_eq!(skipped.len(), 3);
    let outbox = harness.store.list_outbox(job.id).await.unwrap();
    assert!(outbox.iter().all(|entry| entry.status == OutboxStatus::Failed));
    assert!(harness.manager.verify_job(job.id).await.unwrap().holds());
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn concurrency_cap_holds_under_simultaneous_claims(pool: PgPool) {
    let harness = harness(pool, Arc::new(InMemoryAdapter::new("dest"))).await;
    let ids = harness.seed(6).await;

    let job = harness
        .manager
        .create_job(
            CreateJobRequest::new("capped", "source", "dest")
                .documents(ids)
                .concurrency(1)
                .batch_size(1),
        )
        .await
        .unwrap();
    harness.manager.start_job(job.id).await.unwrap();

    let claims = futures::future::join_all((0..6).map(|i| {
        let store = Arc::clone(&harness.store);
        async move { store.claim_batch(&format!("worker-{i}"), 10).await }
    }))
    .await;

    let claimants: Vec<usize> = claims
        .into_iter()
        .map(|batch| batch.unwrap().len())
        .filter(|claimed| *claimed > 0)
        .collect();
    assert_eq!(claimants, vec![1]);
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn cancelled_and_dry_run_jobs_release_their_keys(pool: PgPool) {
    let dest = Arc::new(InMemoryAdapter::new("dest"));
    let harness = harness(pool.clone(), dest.clone()).await;
    let ids = harness.seed(2).await;

    let dry = harness
        .manager
        .create_job(
            CreateJobRequest::new("rehearsal", "source", "dest")
                .documents(ids.clone())
                .dry_run(true),
        )
        .await
        .unwrap();
    assert_eq!(dry.total_documents, 2);

    let first = harness
        .manager
        .create_job(CreateJobRequest::new("abandoned", "source", "dest").documents(ids.clone()))
        .await
        .unwrap();
    assert_eq!(first.total_documents, 2);
    harness.manager.cancel_job(first.id).await.unwrap();

    let second = harness
        .manager
        .create_job(CreateJobRequest::new("second try", "source", "dest").documents(ids))
        .await
        .unwrap();
    assert_eq!(second.total_documents, 2);
    harness.manager.start_job(second.id).await.unwrap();
    let settled = harness.drain(second.id).await;
    assert_status(&settled, JobStatus::Completed);
    assert_eq!(dest.len().await, 2);

    let released: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM migration_items
         WHERE migration_job_id = $1 AND released_at IS NOT NULL",
    )
    .bind(first.id.as_uuid())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(released, 2);
    assert!(harness.manager.verify_job(first.id).await.unwrap().holds());
}

#[sqlx::test(migrator = "docmigrate_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn failed_creation_leaves_no_job_row(pool: PgPool) {
    let harness = harness(pool.clone(), Arc::new(InMemoryAdapter::new("dest"))).await;
    let mut ids = harness.seed(2).await;
    ids.push("docs/missing.md".into());

    let err = harness
        .manager
        .create_job(CreateJobRequest::new("partial", "source", "dest").documents(ids))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Transfer(_)));

    let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migration_jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migration_items")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!((jobs, items), (0, 0));
}
