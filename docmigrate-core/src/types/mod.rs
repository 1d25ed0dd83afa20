//! Strongly typed identifiers.

pub mod ids;

pub use ids::{ItemId, JobId, OutboxId, ProviderId};
