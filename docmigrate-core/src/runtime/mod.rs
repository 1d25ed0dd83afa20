//! Worker pool lifecycle and the per-task transfer step.

mod supervisor;
pub mod transfer;

pub use supervisor::WorkerPool;
pub use transfer::TransferOutcome;
