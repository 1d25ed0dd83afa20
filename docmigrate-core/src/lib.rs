//! # docmigrate core
//!
//! Migration engine that moves documents between storage providers without
//! losing, corrupting, or double-processing any of them.
//!
//! ## Overview
//!
//! - **Provider registry**: resolves a logical provider name to a
//!   [`provider::StorageAdapter`] (filesystem workspace, in-memory, or an
//!   externally supplied object-storage/hosted adapter).
//! - **Content digests**: SHA-256 fingerprints captured at enqueue time and
//!   re-checked against an independently re-fetched destination copy.
//! - **Transactional outbox**: every queued document produces a migration
//!   item and an outbox entry in one transaction, keyed by a globally unique
//!   idempotency key.
//! - **Job manager**: job creation, lifecycle transitions and progress.
//! - **Worker pool**: executors that claim outbox entries with skip-locked
//!   semantics, transfer, verify, and retry with bounded attempts.
//!
//! ## Feature Flags
//!
//! - `postgres` (default): the sqlx-backed [`persistence::PostgresMigrationStore`]
//!   and the embedded [`MIGRATOR`].

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Content hashing and source/destination validation
pub mod digest;

/// Error types shared across the engine
pub mod error;

/// Jobs, items, outbox entries, the manager and progress tracking
pub mod migration;

/// Durable storage for jobs, items and the outbox
pub mod persistence;

/// Storage adapters and the provider registry
pub mod provider;

/// Worker pool that drains the outbox
pub mod runtime;

/// Identifier newtypes
pub mod types;

/// Embedded schema migrations for the Postgres store.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use digest::{ContentDigest, ValidationResult};
pub use error::{MigrationError, Result};
pub use migration::{
    config::EngineConfig,
    job::{CreateJobRequest, DocumentSelection, JobStatus, MigrationJob, Strategy},
    manager::MigrationManager,
    progress::{InvariantReport, Progress},
};
pub use provider::{ProviderRegistry, StorageAdapter};
pub use runtime::WorkerPool;
pub use types::ids::{ItemId, JobId, OutboxId, ProviderId};
