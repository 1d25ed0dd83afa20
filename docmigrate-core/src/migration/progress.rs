//! Progress snapshots and counter invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::ItemStatus;
use super::job::{JobStatus, MigrationJob};
use crate::error::{MigrationError, Result};
use crate::types::ids::JobId;

/// Item counts grouped by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    /// Waiting for a worker.
    pub pending: i64,
    /// Claimed by a worker.
    pub in_progress: i64,
    /// Transferred.
    pub completed: i64,
    /// Gave up.
    pub failed: i64,
    /// Deliberately not transferred.
    pub skipped: i64,
}

impl ItemCounts {
    /// Add `count` items in `status`.
    pub fn add(&mut self, status: ItemStatus, count: i64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::InProgress => self.in_progress += count,
            ItemStatus::Completed => self.completed += count,
            ItemStatus::Failed => self.failed += count,
            ItemStatus::Skipped => self.skipped += count,
        }
    }

    /// All item rows.
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }

    /// Items in a final state.
    pub fn processed(&self) -> i64 {
        self.completed + self.failed + self.skipped
    }

    /// Items still pending or claimed.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.in_progress
    }
}

/// Point-in-time progress snapshot derived from item state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Job the snapshot describes.
    pub job_id: JobId,
    /// Job status at snapshot time.
    pub status: JobStatus,
    /// Item rows.
    pub total: i64,
    /// Completed items.
    pub migrated: i64,
    /// Failed items.
    pub failed: i64,
    /// Skipped items.
    pub skipped: i64,
    /// Pending items.
    pub pending: i64,
    /// Claimed items.
    pub in_progress: i64,
    /// Processed share of the total, 0 to 100.
    pub percent: f64,
    /// Documents processed per second since the job started.
    pub rate: Option<f64>,
    /// Estimated seconds to completion; only while running.
    pub eta_seconds: Option<u64>,
}

impl Progress {
    /// Build a snapshot from the job row and its item counts.
    pub fn compute(job: &MigrationJob, counts: &ItemCounts, now: DateTime<Utc>) -> Self {
        let total = counts.total();
        let processed = counts.processed();
        let percent = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64) * 100.0
        };

        let rate = job.started_at.and_then(|started| {
            let end = job.completed_at.unwrap_or(now);
            let elapsed = (end - started).num_milliseconds() as f64 / 1_000.0;
            (elapsed > 0.0 && processed > 0).then(|| processed as f64 / elapsed)
        });

        let eta_seconds = match (job.status, rate) {
            (JobStatus::Running, Some(rate)) if rate > 0.0 => {
                Some((counts.outstanding() as f64 / rate).ceil() as u64)
            }
            _ => None,
        };

        Self {
            job_id: job.id,
            status: job.status,
            total,
            migrated: counts.completed,
            failed: counts.failed,
            skipped: counts.skipped,
            pending: counts.pending,
            in_progress: counts.in_progress,
            percent,
            rate,
            eta_seconds,
        }
    }
}

/// Result of checking a job's counters against its item rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvariantReport {
    /// Checked job.
    pub job_id: JobId,
    /// Job status at check time.
    pub status: JobStatus,
    /// Item counts the counters were compared against.
    pub counts: ItemCounts,
    /// Human readable description of each broken invariant.
    pub violations: Vec<String>,
}

impl InvariantReport {
    /// `unverified_completions` counts completed items lacking a published
    /// outbox entry or a positive content match.
    pub fn evaluate(job: &MigrationJob, counts: ItemCounts, unverified_completions: i64) -> Self {
        let mut violations = Vec::new();

        if job.total_documents != counts.total() {
            violations.push(format!(
                "total_documents {} != item rows {}",
                job.total_documents,
                counts.total()
            ));
        }
        if job.migrated_documents != counts.completed {
            violations.push(format!(
                "migrated_documents {} != completed items {}",
                job.migrated_documents, counts.completed
            ));
        }
        if job.failed_documents != counts.failed {
            violations.push(format!(
                "failed_documents {} != failed items {}",
                job.failed_documents, counts.failed
            ));
        }
        if job.skipped_documents != counts.skipped {
            violations.push(format!(
                "skipped_documents {} != skipped items {}",
                job.skipped_documents, counts.skipped
            ));
        }
        if job.status.is_terminal() && counts.pending > 0 {
            violations.push(format!(
                "{} items still pending in terminal job",
                counts.pending
            ));
        }
        // Cancelled jobs let in-flight claims drain after the status flips.
        if job.status.is_terminal() && job.status != JobStatus::Cancelled && counts.in_progress > 0
        {
            violations.push(format!(
                "{} items still in progress in settled job",
                counts.in_progress
            ));
        }
        if unverified_completions > 0 {
            violations.push(format!(
                "{unverified_completions} completed items lack a published outbox entry or content match"
            ));
        }

        Self {
            job_id: job.id,
            status: job.status,
            counts,
            violations,
        }
    }

    /// Whether no invariant is broken.
    pub fn holds(&self) -> bool {
        self.violations.is_empty()
    }

    /// `InvariantViolation` listing every broken invariant, or the report.
    pub fn into_result(self) -> Result<Self> {
        if self.holds() {
            Ok(self)
        } else {
            Err(MigrationError::InvariantViolation(format!(
                "job {}: {}",
                self.job_id,
                self.violations.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::job::{DocumentSelection, Strategy};
    use crate::types::ids::ProviderId;
    use chrono::Duration;

    fn job(status: JobStatus, started_secs_ago: i64) -> MigrationJob {
        let now = Utc::now();
        MigrationJob {
            id: JobId::new(),
            job_name: "job".into(),
            source_provider_id: ProviderId::new(),
            dest_provider_id: ProviderId::new(),
            source_provider: "a".into(),
            dest_provider: "b".into(),
            strategy: Strategy::Copy,
            status,
            selection: DocumentSelection::None,
            dry_run: false,
            concurrency: 1,
            batch_size: 10,
            max_attempts: 3,
            created_by: "system".into(),
            total_documents: 10,
            migrated_documents: 4,
            failed_documents: 0,
            skipped_documents: 0,
            created_at: now,
            updated_at: now,
            started_at: Some(now - Duration::seconds(started_secs_ago)),
            completed_at: None,
        }
    }

    #[test]
    fn progress_reports_rate_and_eta_while_running() {
        let job = job(JobStatus::Running, 2);
        let counts = ItemCounts {
            pending: 6,
            completed: 4,
            ..Default::default()
        };
        let progress = Progress::compute(&job, &counts, Utc::now());
        assert_eq!(progress.total, 10);
        assert!((progress.percent - 40.0).abs() < f64::EPSILON);
        let rate = progress.rate.expect("rate");
        assert!(rate > 1.0 && rate <= 2.1, "rate {rate}");
        assert!(progress.eta_seconds.is_some());
    }

    #[test]
    fn empty_job_reports_zero_percent() {
        let job = job(JobStatus::Pending, 0);
        let progress = Progress::compute(&job, &ItemCounts::default(), Utc::now());
        assert_eq!(progress.percent, 0.0);
        assert!(progress.eta_seconds.is_none());
    }

    #[test]
    fn report_flags_counter_drift() {
        let job = job(JobStatus::Running, 1);
        let counts = ItemCounts {
            pending: 6,
            completed: 3,
            failed: 1,
            ..Default::default()
        };
        let report = InvariantReport::evaluate(&job, counts, 0);
        assert!(!report.holds());
        assert_eq!(report.violations.len(), 2);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, MigrationError::InvariantViolation(ref msg) if msg.contains("migrated_documents")));
    }

    #[test]
    fn consistent_report_converts_to_ok() {
        let mut job = job(JobStatus::Completed, 1);
        job.total_documents = 4;
        let counts = ItemCounts {
            completed: 4,
            ..Default::default()
        };
        let report = InvariantReport::evaluate(&job, counts, 0);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn settled_job_with_pending_items_is_a_violation() {
        let mut job = job(JobStatus::Completed, 1);
        job.total_documents = 5;
        job.migrated_documents = 4;
        let counts = ItemCounts {
            pending: 1,
            completed: 4,
            ..Default::default()
        };
        let report = InvariantReport::evaluate(&job, counts, 0);
        assert!(report.violations.iter().any(|v| v.contains("pending")));
    }
}
