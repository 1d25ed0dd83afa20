//! Job, item and outbox model plus the manager that owns job lifecycle.

pub mod config;
pub mod item;
pub mod job;
pub mod manager;
pub mod outbox;
pub mod progress;

pub use config::{EngineConfig, JobDefaults, RetryConfig, WorkerConfig};
pub use item::{ItemFilter, ItemStatus, MigrationItem};
pub use job::{
    CreateJobRequest, DocumentSelection, JobStatus, MigrationJob, Strategy,
};
pub use manager::MigrationManager;
pub use outbox::{
    ClaimedTask, IdempotencyKey, OutboxEntry, OutboxStatus, TaskPayload,
};
pub use progress::{InvariantReport, ItemCounts, Progress};
