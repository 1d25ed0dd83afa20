//! Postgres-backed store.
//!
//! Claims lock outbox rows with `FOR UPDATE OF o SKIP LOCKED`, so any number
//! of executors across processes can poll the same tables without blocking
//! on each other or double-claiming a row. The job row is held with
//! `FOR UPDATE OF j SKIP LOCKED` for the length of the claim, which keeps
//! the per-job claimant count below the job's concurrency.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Decode, PgConnection, PgPool, Postgres, Row, Type};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{
    CANCELLED_ERROR, CLAIM_EXPIRED_ERROR, FailureDisposition, MigrationStore, NewItem, retry_at,
};
use crate::digest::ContentDigest;
use crate::error::{MigrationError, Result};
use crate::migration::config::RetryConfig;
use crate::migration::item::{ItemFilter, ItemStatus, MigrationItem};
use crate::migration::job::{DocumentSelection, JobStatus, MigrationJob, Strategy};
use crate::migration::outbox::{
    ClaimedTask, EVENT_TASK_CREATED, IdempotencyKey, OutboxEntry, OutboxStatus, TaskPayload,
};
use crate::migration::progress::ItemCounts;
use crate::provider::{
    ProviderKind, ProviderRegistration, ProviderStatus, validate_provider_name,
};
use crate::types::ids::{ItemId, JobId, OutboxId, ProviderId};

const JOB_COLUMNS: &str = r#"
    id, job_name, source_provider_id, dest_provider_id, source_provider, dest_provider,
    strategy, status, filter_criteria, dry_run, concurrency, batch_size, max_attempts,
    created_by, total_documents, migrated_documents, failed_documents, skipped_documents,
    created_at, updated_at, started_at, completed_at
"#;

const ITEM_COLUMNS: &str = r#"
    id, migration_job_id, document_id, dest_document_id, source_provider_id,
    dest_provider_id, idempotent_key, source_digest, dest_digest, status, attempt_count,
    max_attempts, error_message, content_match, created_at, updated_at, started_at,
    completed_at, duration_ms
"#;

const OUTBOX_COLUMNS: &str = r#"
    id, migration_job_id, migration_item_id, idempotent_key, event_type, status, payload,
    publish_attempts, claimed_by, claimed_at, available_at, published_at, last_error,
    created_at
"#;

const PROVIDER_COLUMNS: &str =
    "id, name, kind, config, is_primary, is_readable, is_writable, status";

/// Store backed by a `sqlx` Postgres pool.
#[derive(Clone)]
pub struct PostgresMigrationStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresMigrationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresMigrationStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

/// A claimed row locked for a failure update.
struct HeldAttempt {
    outbox_id: Uuid,
    item_id: Uuid,
    job_id: Uuid,
    job_status: JobStatus,
    attempt_count: i32,
    max_attempts: i32,
}

fn db(context: &'static str) -> impl Fn(sqlx::Error) -> MigrationError {
    move |e| MigrationError::Database(format!("{context} failed: {e}"))
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| MigrationError::Database(format!("decode column {name}: {e}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn provider_from_row(row: &PgRow) -> Result<ProviderRegistration> {
    Ok(ProviderRegistration {
        id: ProviderId(col(row, "id")?),
        name: col(row, "name")?,
        kind: ProviderKind::parse(&col::<String>(row, "kind")?)?,
        config: col(row, "config")?,
        is_primary: col(row, "is_primary")?,
        is_readable: col(row, "is_readable")?,
        is_writable: col(row, "is_writable")?,
        status: ProviderStatus::parse(&col::<String>(row, "status")?)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<MigrationJob> {
    let selection: DocumentSelection =
        serde_json::from_value(col::<serde_json::Value>(row, "filter_criteria")?)?;
    Ok(MigrationJob {
        id: JobId(col(row, "id")?),
        job_name: col(row, "job_name")?,
        source_provider_id: ProviderId(col(row, "source_provider_id")?),
        dest_provider_id: ProviderId(col(row, "dest_provider_id")?),
        source_provider: col(row, "source_provider")?,
        dest_provider: col(row, "dest_provider")?,
        strategy: Strategy::parse(&col::<String>(row, "strategy")?)?,
        status: JobStatus::parse(&col::<String>(row, "status")?)?,
        selection,
        dry_run: col(row, "dry_run")?,
        concurrency: to_u32(col(row, "concurrency")?),
        batch_size: to_u32(col(row, "batch_size")?),
        max_attempts: to_u32(col(row, "max_attempts")?),
        created_by: col(row, "created_by")?,
        total_documents: i64::from(col::<i32>(row, "total_documents")?),
        migrated_documents: i64::from(col::<i32>(row, "migrated_documents")?),
        failed_documents: i64::from(col::<i32>(row, "failed_documents")?),
        skipped_documents: i64::from(col::<i32>(row, "skipped_documents")?),
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        started_at: col(row, "started_at")?,
        completed_at: col(row, "completed_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<MigrationItem> {
    let dest_digest = col::<Option<String>>(row, "dest_digest")?
        .map(|raw| ContentDigest::parse(&raw))
        .transpose()?;
    Ok(MigrationItem {
        id: ItemId(col(row, "id")?),
        job_id: JobId(col(row, "migration_job_id")?),
        document_id: col(row, "document_id")?,
        dest_document_id: col(row, "dest_document_id")?,
        source_provider_id: ProviderId(col(row, "source_provider_id")?),
        dest_provider_id: ProviderId(col(row, "dest_provider_id")?),
        idempotent_key: col(row, "idempotent_key")?,
        source_digest: ContentDigest::parse(&col::<String>(row, "source_digest")?)?,
        dest_digest,
        status: ItemStatus::parse(&col::<String>(row, "status")?)?,
        attempt_count: to_u32(col(row, "attempt_count")?),
        max_attempts: to_u32(col(row, "max_attempts")?),
        error_message: col(row, "error_message")?,
        content_match: col(row, "content_match")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        started_at: col(row, "started_at")?,
        completed_at: col(row, "completed_at")?,
        duration_ms: col(row, "duration_ms")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEntry> {
    let payload: TaskPayload = serde_json::from_value(col::<serde_json::Value>(row, "payload")?)?;
    Ok(OutboxEntry {
        id: OutboxId(col(row, "id")?),
        job_id: JobId(col(row, "migration_job_id")?),
        item_id: ItemId(col(row, "migration_item_id")?),
        idempotent_key: col(row, "idempotent_key")?,
        event_type: col(row, "event_type")?,
        status: OutboxStatus::parse(&col::<String>(row, "status")?)?,
        payload,
        publish_attempts: to_u32(col(row, "publish_attempts")?),
        claimed_by: col(row, "claimed_by")?,
        claimed_at: col(row, "claimed_at")?,
        available_at: col(row, "available_at")?,
        published_at: col(row, "published_at")?,
        last_error: col(row, "last_error")?,
        created_at: col(row, "created_at")?,
    })
}

impl PostgresMigrationStore {
    /// Connect to an already migrated database and verify health + schema.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                MigrationError::Database(format!(
                    "migration store failed Postgres health check: {e}"
                ))
            })?;

        // The claim query relies on this partial index to stay cheap.
        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_migration_outbox_ready_dequeue")
        .fetch_optional(&pool)
        .await
        .map_err(db("migration store schema validation"))?
        .is_some();

        if !idx_exists {
            return Err(MigrationError::Database(
                "Required index idx_migration_outbox_ready_dequeue is missing; run migrations"
                    .into(),
            ));
        }

        info!(target: "migration::store", "migration store connected to Postgres");
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
        crate::MIGRATOR.run(pool).await?;
        Ok(())
    }

    async fn lock_job_status(conn: &mut PgConnection, id: JobId) -> Result<MigrationJob> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM migration_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db("job lock"))?
        .ok_or_else(|| MigrationError::JobNotFound(id.to_string()))?;
        job_from_row(&row)
    }

    async fn fail_attempt(
        conn: &mut PgConnection,
        held: &HeldAttempt,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition> {
        let now = Utc::now();
        let disposition = match retry_after {
            _ if held.job_status == JobStatus::Cancelled => FailureDisposition::Skipped,
            Some(delay) if held.attempt_count < held.max_attempts => {
                FailureDisposition::Retrying {
                    available_at: retry_at(now, delay),
                }
            }
            _ => FailureDisposition::Failed,
        };

        let (item_status, outbox_status, available_at) = match disposition {
            FailureDisposition::Retrying { available_at } => {
                (ItemStatus::Pending, OutboxStatus::Pending, Some(available_at))
            }
            FailureDisposition::Failed => (ItemStatus::Failed, OutboxStatus::Failed, None),
            FailureDisposition::Skipped => (ItemStatus::Skipped, OutboxStatus::Failed, None),
        };

        sqlx::query(
            r#"
            UPDATE migration_outbox
            SET status = $2,
                last_error = $3,
                claimed_by = NULL,
                claimed_at = NULL,
                available_at = COALESCE($4, available_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(held.outbox_id)
        .bind(outbox_status.as_str())
        .bind(error)
        .bind(available_at)
        .execute(&mut *conn)
        .await
        .map_err(db("outbox failure update"))?;

        sqlx::query(
            r#"
            UPDATE migration_items
            SET status = $2,
                error_message = $3,
                completed_at = CASE WHEN $2 = 'pending' THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(held.item_id)
        .bind(item_status.as_str())
        .bind(error)
        .execute(&mut *conn)
        .await
        .map_err(db("item failure update"))?;

        let counter = match disposition {
            FailureDisposition::Failed => Some("failed_documents"),
            FailureDisposition::Skipped => Some("skipped_documents"),
            FailureDisposition::Retrying { .. } => None,
        };
        if let Some(counter) = counter {
            sqlx::query(&format!(
                "UPDATE migration_jobs SET {counter} = {counter} + 1, updated_at = NOW() WHERE id = $1"
            ))
            .bind(held.job_id)
            .execute(&mut *conn)
            .await
            .map_err(db("job counter update"))?;
        }

        Ok(disposition)
    }

    /// Hand `key` over when its holder ended skipped or failed inside a
    /// terminal job. The old rows keep their history under a released key.
    async fn release_key(conn: &mut PgConnection, key: &str) -> Result<()> {
        let released = sqlx::query_scalar::<_, Uuid>(
            r#"
            WITH released AS (
                UPDATE migration_items i
                SET idempotent_key = i.idempotent_key || '#released:' || i.id::text,
                    released_at = NOW(),
                    updated_at = NOW()
                FROM migration_jobs j
                WHERE i.idempotent_key = $1
                  AND j.id = i.migration_job_id
                  AND i.status IN ('skipped', 'failed')
                  AND j.status IN ('completed', 'failed', 'partial', 'cancelled')
                RETURNING i.id
            ),
            outbox AS (
                UPDATE migration_outbox o
                SET idempotent_key = o.idempotent_key || '#released:' || o.migration_item_id::text,
                    updated_at = NOW()
                FROM released r
                WHERE o.migration_item_id = r.id
            )
            SELECT id FROM released
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db("idempotency key release"))?;

        if let Some(item_id) = released {
            debug!(
                target: "migration::store",
                key,
                released_key = %IdempotencyKey::released(key, ItemId(item_id)),
                "idempotency key released to a new job"
            );
        }
        Ok(())
    }

    /// Item + outbox inserts shared by job creation and later queueing.
    async fn insert_items(
        conn: &mut PgConnection,
        job: &MigrationJob,
        items: Vec<NewItem>,
    ) -> Result<u64> {
        let mut inserted = 0u64;
        for item in items {
            Self::release_key(&mut *conn, item.idempotent_key.as_str()).await?;

            let created = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO migration_items (
                    id, migration_job_id, document_id, dest_document_id, source_provider_id,
                    dest_provider_id, idempotent_key, source_digest, status, max_attempts
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9)
                ON CONFLICT (idempotent_key) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(item.item_id.as_uuid())
            .bind(job.id.as_uuid())
            .bind(&item.payload.document_id)
            .bind(&item.payload.dest_document_id)
            .bind(job.source_provider_id.as_uuid())
            .bind(job.dest_provider_id.as_uuid())
            .bind(item.idempotent_key.as_str())
            .bind(item.payload.source_digest.to_string())
            .bind(to_i32(job.max_attempts))
            .fetch_optional(&mut *conn)
            .await
            .map_err(db("item insert"))?;

            if created.is_none() {
                trace!(target: "migration::store", key = %item.idempotent_key, "duplicate key ignored");
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO migration_outbox (
                    id, migration_job_id, migration_item_id, idempotent_key, event_type,
                    status, payload
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', $6)
                ON CONFLICT (idempotent_key) DO NOTHING
                "#,
            )
            .bind(item.outbox_id.as_uuid())
            .bind(job.id.as_uuid())
            .bind(item.item_id.as_uuid())
            .bind(item.idempotent_key.as_str())
            .bind(EVENT_TASK_CREATED)
            .bind(serde_json::to_value(&item.payload)?)
            .execute(&mut *conn)
            .await
            .map_err(db("outbox insert"))?;
            inserted += 1;
        }

        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET total_documents = total_documents + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(i32::try_from(inserted).unwrap_or(i32::MAX))
        .execute(&mut *conn)
        .await
        .map_err(db("job total update"))?;

        Ok(inserted)
    }

    fn held_from_row(row: &PgRow) -> Result<HeldAttempt> {
        Ok(HeldAttempt {
            outbox_id: col(row, "outbox_id")?,
            item_id: col(row, "item_id")?,
            job_id: col(row, "job_id")?,
            job_status: JobStatus::parse(&col::<String>(row, "job_status")?)?,
            attempt_count: col(row, "attempt_count")?,
            max_attempts: col(row, "max_attempts")?,
        })
    }
}

const HELD_ATTEMPT_SELECT: &str = r#"
    SELECT o.id AS outbox_id,
           o.migration_item_id AS item_id,
           o.migration_job_id AS job_id,
           j.status AS job_status,
           i.attempt_count,
           i.max_attempts,
           o.publish_attempts
    FROM migration_outbox o
    JOIN migration_items i ON i.id = o.migration_item_id
    JOIN migration_jobs j ON j.id = o.migration_job_id
"#;

#[async_trait]
impl MigrationStore for PostgresMigrationStore {
    async fn upsert_provider(
        &self,
        registration: &ProviderRegistration,
    ) -> Result<ProviderRegistration> {
        validate_provider_name(&registration.name)?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO provider_storage
                (id, name, kind, config, is_primary, is_readable, is_writable, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE
            SET kind = EXCLUDED.kind,
                config = EXCLUDED.config,
                is_primary = EXCLUDED.is_primary,
                is_readable = EXCLUDED.is_readable,
                is_writable = EXCLUDED.is_writable,
                status = EXCLUDED.status,
                updated_at = NOW()
            RETURNING {PROVIDER_COLUMNS}
            "#
        ))
        .bind(registration.id.as_uuid())
        .bind(&registration.name)
        .bind(registration.kind.as_str())
        .bind(&registration.config)
        .bind(registration.is_primary)
        .bind(registration.is_readable)
        .bind(registration.is_writable)
        .bind(registration.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db("provider upsert"))?;
        provider_from_row(&row)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderRegistration>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM provider_storage ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db("provider listing"))?;
        rows.iter().map(provider_from_row).collect()
    }

    async fn get_provider(&self, name: &str) -> Result<Option<ProviderRegistration>> {
        let row = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM provider_storage WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("provider lookup"))?;
        row.as_ref().map(provider_from_row).transpose()
    }

    async fn create_job(&self, job: &MigrationJob, items: Vec<NewItem>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db("create transaction"))?;
        sqlx::query(
            r#"
            INSERT INTO migration_jobs (
                id, job_name, source_provider_id, dest_provider_id, source_provider,
                dest_provider, strategy, status, filter_criteria, dry_run, concurrency,
                batch_size, max_attempts, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_name)
        .bind(job.source_provider_id.as_uuid())
        .bind(job.dest_provider_id.as_uuid())
        .bind(&job.source_provider)
        .bind(&job.dest_provider)
        .bind(job.strategy.as_str())
        .bind(job.status.as_str())
        .bind(serde_json::to_value(&job.selection)?)
        .bind(job.dry_run)
        .bind(to_i32(job.concurrency))
        .bind(to_i32(job.batch_size))
        .bind(to_i32(job.max_attempts))
        .bind(&job.created_by)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db("job insert"))?;

        let inserted = Self::insert_items(&mut tx, job, items).await?;
        tx.commit().await.map_err(db("create commit"))?;
        Ok(inserted)
    }

    async fn get_job(&self, id: JobId) -> Result<MigrationJob> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM migration_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db("job lookup"))?
            .ok_or_else(|| MigrationError::JobNotFound(id.to_string()))?;
        job_from_row(&row)
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<MigrationJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM migration_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db("job listing"))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn queue_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db("queue transaction"))?;
        let job = Self::lock_job_status(&mut tx, job_id).await?;
        if !job.status.accepts_documents() {
            return Err(MigrationError::InvalidTransition(format!(
                "job {job_id} is {} and no longer accepts documents",
                job.status
            )));
        }

        let inserted = Self::insert_items(&mut tx, &job, items).await?;
        tx.commit().await.map_err(db("queue commit"))?;
        Ok(inserted)
    }

    async fn transition_job(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<MigrationJob> {
        let allowed: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query(&format!(
            r#"
            UPDATE migration_jobs
            SET status = $2,
                updated_at = NOW(),
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW())
                                  ELSE started_at END,
                completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = ANY($4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("job transition"))?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                let current = self.get_job(id).await?;
                Err(MigrationError::InvalidTransition(format!(
                    "job {id} cannot move from {} to {to}",
                    current.status
                )))
            }
        }
    }

    async fn cancel_job(&self, id: JobId) -> Result<MigrationJob> {
        let mut tx = self.pool.begin().await.map_err(db("cancel transaction"))?;
        let job = Self::lock_job_status(&mut tx, id).await?;
        if !matches!(
            job.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused
        ) {
            return Err(MigrationError::InvalidTransition(format!(
                "job {id} cannot move from {} to cancelled",
                job.status
            )));
        }

        let skipped = sqlx::query(
            r#"
            WITH cancelled AS (
                UPDATE migration_outbox
                SET status = 'failed', last_error = $2, updated_at = NOW()
                WHERE migration_job_id = $1 AND status = 'pending'
                RETURNING migration_item_id
            )
            UPDATE migration_items i
            SET status = 'skipped',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            FROM cancelled c
            WHERE i.id = c.migration_item_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(CANCELLED_ERROR)
        .execute(&mut *tx)
        .await
        .map_err(db("cancel pending items"))?
        .rows_affected();

        let row = sqlx::query(&format!(
            r#"
            UPDATE migration_jobs
            SET status = 'cancelled',
                skipped_documents = skipped_documents + $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(i32::try_from(skipped).unwrap_or(i32::MAX))
        .fetch_one(&mut *tx)
        .await
        .map_err(db("job cancel"))?;
        let job = job_from_row(&row)?;

        tx.commit().await.map_err(db("cancel commit"))?;
        debug!(target: "migration::store", job_id = %id, skipped, "job cancelled");
        Ok(job)
    }

    async fn requeue_failed(&self, id: JobId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db("retry transaction"))?;
        let job = Self::lock_job_status(&mut tx, id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Partial) {
            return Err(MigrationError::InvalidTransition(format!(
                "job {id} is {}; only failed or partial jobs can be retried",
                job.status
            )));
        }

        let requeued = sqlx::query(
            r#"
            WITH requeued AS (
                UPDATE migration_items
                SET status = 'pending',
                    max_attempts = attempt_count + $2,
                    completed_at = NULL,
                    updated_at = NOW()
                WHERE migration_job_id = $1
                  AND status = 'failed'
                  AND released_at IS NULL
                RETURNING id
            )
            UPDATE migration_outbox o
            SET status = 'pending', available_at = NOW(), updated_at = NOW()
            FROM requeued r
            WHERE o.migration_item_id = r.id
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(job.max_attempts))
        .execute(&mut *tx)
        .await
        .map_err(db("requeue failed items"))?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET status = 'running',
                failed_documents = failed_documents - $2,
                completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(i32::try_from(requeued).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await
        .map_err(db("job retry"))?;

        tx.commit().await.map_err(db("retry commit"))?;
        Ok(requeued)
    }

    async fn claim_batch(&self, worker_id: &str, limit: u32) -> Result<Vec<ClaimedTask>> {
        let mut tx = self.pool.begin().await.map_err(db("claim transaction"))?;

        let job = sqlx::query(
            r#"
            SELECT j.id, j.batch_size, j.concurrency
            FROM migration_jobs j
            WHERE j.status = 'running'
              AND EXISTS (
                  SELECT 1 FROM migration_outbox o
                  WHERE o.migration_job_id = j.id
                    AND o.status = 'pending'
                    AND o.available_at <= NOW()
              )
              AND (
                  SELECT COUNT(DISTINCT o.claimed_by) FROM migration_outbox o
                  WHERE o.migration_job_id = j.id
                    AND o.status = 'in_flight'
                    AND o.claimed_by <> $1
              ) < j.concurrency
            ORDER BY j.started_at NULLS LAST, j.created_at, j.id
            LIMIT 1
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db("claim job selection"))?;

        let Some(job) = job else {
            return Ok(Vec::new());
        };
        let job_id: Uuid = col(&job, "id")?;
        let take = to_u32(col(&job, "batch_size")?).min(limit).max(1);
        let concurrency: i32 = col(&job, "concurrency")?;

        // The selection may have counted on a snapshot taken before the
        // previous lock holder committed; count again under the lock.
        let claimants: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT claimed_by) FROM migration_outbox
            WHERE migration_job_id = $1
              AND status = 'in_flight'
              AND claimed_by <> $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db("claimant count"))?;
        if claimants >= i64::from(concurrency) {
            return Ok(Vec::new());
        }

        let claimed = sqlx::query(
            r#"
            WITH ready AS (
                SELECT o.id
                FROM migration_outbox o
                WHERE o.migration_job_id = $1
                  AND o.status = 'pending'
                  AND o.available_at <= NOW()
                ORDER BY o.created_at, o.id
                LIMIT $2
                FOR UPDATE OF o SKIP LOCKED
            )
            UPDATE migration_outbox o
            SET status = 'in_flight',
                claimed_by = $3,
                claimed_at = NOW(),
                publish_attempts = o.publish_attempts + 1,
                updated_at = NOW()
            FROM ready
            WHERE o.id = ready.id
            RETURNING o.id, o.migration_item_id, o.payload, o.claimed_at, o.created_at
            "#,
        )
        .bind(job_id)
        .bind(i64::from(take))
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db("outbox claim"))?;

        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let item_ids = claimed
            .iter()
            .map(|row| col::<Uuid>(row, "migration_item_id"))
            .collect::<Result<Vec<_>>>()?;
        let attempts = sqlx::query(
            r#"
            UPDATE migration_items
            SET status = 'in_progress',
                attempt_count = attempt_count + 1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING id, attempt_count, max_attempts
            "#,
        )
        .bind(&item_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db("item claim"))?;

        let mut budget = std::collections::HashMap::with_capacity(attempts.len());
        for row in &attempts {
            budget.insert(
                col::<Uuid>(row, "id")?,
                (
                    to_u32(col(row, "attempt_count")?),
                    to_u32(col(row, "max_attempts")?),
                ),
            );
        }

        let mut ordered: Vec<(DateTime<Utc>, Uuid, &PgRow)> = Vec::with_capacity(claimed.len());
        for row in &claimed {
            ordered.push((col(row, "created_at")?, col(row, "id")?, row));
        }
        ordered.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut tasks = Vec::with_capacity(ordered.len());
        for (_, outbox_id, row) in ordered {
            let item_id: Uuid = col(row, "migration_item_id")?;
            let (attempt, max_attempts) = budget.get(&item_id).copied().ok_or_else(|| {
                MigrationError::Internal(format!("claimed outbox {outbox_id} has no item row"))
            })?;
            tasks.push(ClaimedTask {
                outbox_id: OutboxId(outbox_id),
                worker_id: worker_id.to_string(),
                claimed_at: col(row, "claimed_at")?,
                attempt,
                max_attempts,
                payload: serde_json::from_value(col::<serde_json::Value>(row, "payload")?)?,
            });
        }

        tx.commit().await.map_err(db("claim commit"))?;
        trace!(target: "migration::store", worker = worker_id, job_id = %job_id, claimed = tasks.len(), "batch claimed");
        Ok(tasks)
    }

    async fn complete_item(
        &self,
        claim: &ClaimedTask,
        dest_digest: ContentDigest,
        duration_ms: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db("complete transaction"))?;

        let published = sqlx::query(
            r#"
            UPDATE migration_outbox
            SET status = 'published',
                published_at = NOW(),
                claimed_by = NULL,
                claimed_at = NULL,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'in_flight' AND claimed_by = $2 AND claimed_at = $3
            "#,
        )
        .bind(claim.outbox_id.as_uuid())
        .bind(&claim.worker_id)
        .bind(claim.claimed_at)
        .execute(&mut *tx)
        .await
        .map_err(db("outbox publish"))?
        .rows_affected();

        if published == 0 {
            return Err(MigrationError::ClaimConflict(format!(
                "outbox entry {} is no longer held by {}",
                claim.outbox_id, claim.worker_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE migration_items
            SET status = 'completed',
                dest_digest = $2,
                content_match = (source_digest = $2),
                error_message = NULL,
                completed_at = NOW(),
                duration_ms = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(claim.item_id().as_uuid())
        .bind(dest_digest.to_string())
        .bind(duration_ms)
        .execute(&mut *tx)
        .await
        .map_err(db("item completion"))?;

        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET migrated_documents = migrated_documents + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(claim.job_id().as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(db("job migrated increment"))?;

        tx.commit().await.map_err(db("complete commit"))?;
        Ok(())
    }

    async fn skip_item(&self, claim: &ClaimedTask, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db("skip transaction"))?;

        let published = sqlx::query(
            r#"
            UPDATE migration_outbox
            SET status = 'published',
                published_at = NOW(),
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'in_flight' AND claimed_by = $2 AND claimed_at = $3
            "#,
        )
        .bind(claim.outbox_id.as_uuid())
        .bind(&claim.worker_id)
        .bind(claim.claimed_at)
        .execute(&mut *tx)
        .await
        .map_err(db("outbox publish"))?
        .rows_affected();

        if published == 0 {
            return Err(MigrationError::ClaimConflict(format!(
                "outbox entry {} is no longer held by {}",
                claim.outbox_id, claim.worker_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE migration_items
            SET status = 'skipped', error_message = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(claim.item_id().as_uuid())
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(db("item skip"))?;

        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET skipped_documents = skipped_documents + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(claim.job_id().as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(db("job skipped increment"))?;

        tx.commit().await.map_err(db("skip commit"))?;
        Ok(())
    }

    async fn record_failure(
        &self,
        claim: &ClaimedTask,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await.map_err(db("failure transaction"))?;

        let row = sqlx::query(&format!(
            r#"
            {HELD_ATTEMPT_SELECT}
            WHERE o.id = $1 AND o.status = 'in_flight' AND o.claimed_by = $2 AND o.claimed_at = $3
            FOR UPDATE OF o, i
            "#
        ))
        .bind(claim.outbox_id.as_uuid())
        .bind(&claim.worker_id)
        .bind(claim.claimed_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db("failure claim check"))?;

        let Some(row) = row else {
            return Err(MigrationError::ClaimConflict(format!(
                "outbox entry {} is no longer held by {}",
                claim.outbox_id, claim.worker_id
            )));
        };
        let held = Self::held_from_row(&row)?;

        let disposition = Self::fail_attempt(&mut tx, &held, error, retry_after).await?;
        tx.commit().await.map_err(db("failure commit"))?;
        Ok(disposition)
    }

    async fn settle_job(&self, id: JobId) -> Result<Option<JobStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE migration_jobs j
            SET status = CASE
                    WHEN j.failed_documents = 0 THEN 'completed'
                    WHEN j.migrated_documents + j.skipped_documents = 0 THEN 'failed'
                    ELSE 'partial'
                END,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE j.id = $1
              AND j.status = 'running'
              AND j.total_documents > 0
              AND NOT EXISTS (
                  SELECT 1 FROM migration_items i
                  WHERE i.migration_job_id = j.id
                    AND i.status IN ('pending', 'in_progress')
              )
            RETURNING j.status
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db("job settle"))?;

        status.map(|raw| JobStatus::parse(&raw)).transpose()
    }

    async fn release_expired_claims(
        &self,
        ttl: chrono::Duration,
        retry: &RetryConfig,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db("reaper transaction"))?;
        let cutoff = Utc::now() - ttl;

        let rows = sqlx::query(&format!(
            r#"
            {HELD_ATTEMPT_SELECT}
            WHERE o.status = 'in_flight' AND o.claimed_at < $1
            FOR UPDATE OF o, i SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db("expired claim scan"))?;

        let mut released = 0u64;
        for row in &rows {
            let held = Self::held_from_row(row)?;
            let attempt = to_u32(col(row, "publish_attempts")?);
            Self::fail_attempt(
                &mut tx,
                &held,
                CLAIM_EXPIRED_ERROR,
                Some(retry.delay_for_attempt(attempt)),
            )
            .await?;
            released += 1;
        }

        tx.commit().await.map_err(db("reaper commit"))?;
        Ok(released)
    }

    async fn item_counts(&self, id: JobId) -> Result<ItemCounts> {
        // Surfaces JobNotFound rather than an all-zero snapshot.
        self.get_job(id).await?;

        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM migration_items
            WHERE migration_job_id = $1
            GROUP BY status
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db("item counts"))?;

        let mut counts = ItemCounts::default();
        for row in &rows {
            let status = ItemStatus::parse(&col::<String>(row, "status")?)?;
            counts.add(status, col(row, "count")?);
        }
        Ok(counts)
    }

    async fn list_items(&self, id: JobId, filter: ItemFilter) -> Result<Vec<MigrationItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM migration_items
            WHERE migration_job_id = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at, id
            LIMIT $3
            "#
        ))
        .bind(id.as_uuid())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db("item listing"))?;
        rows.iter().map(item_from_row).collect()
    }

    async fn list_outbox(&self, id: JobId) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM migration_outbox
            WHERE migration_job_id = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db("outbox listing"))?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn unverified_completions(&self, id: JobId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM migration_items i
            LEFT JOIN migration_outbox o
              ON o.migration_item_id = i.id AND o.status = 'published'
            WHERE i.migration_job_id = $1
              AND i.status = 'completed'
              AND (o.id IS NULL OR i.content_match IS DISTINCT FROM TRUE)
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(db("unverified completion count"))
    }
}
