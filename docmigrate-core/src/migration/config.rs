//! Engine configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on per-job executor concurrency.
pub const MAX_CONCURRENCY: u32 = 64;
/// Upper bound on entries claimed per batch.
pub const MAX_BATCH_SIZE: u32 = 1_000;
/// Upper bound on attempts per item.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Engine-wide knobs.
///
/// Every field has a default so a deployment only needs to spell out what it
/// changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executor pool sizing, polling and claim housekeeping.
    pub worker: WorkerConfig,
    /// Per-item retry/backoff policy.
    pub retry: RetryConfig,
    /// Defaults applied to jobs that leave a knob unset.
    pub jobs: JobDefaults,
}

/// Executor pool settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of executor tasks in this process.
    pub workers: usize,
    /// Idle sleep between polls when nothing is claimable (ms).
    pub poll_interval_ms: u64,
    /// Hard cap on entries a single executor claims at once; a job's own
    /// `batch_size` can only lower it.
    pub claim_batch_limit: u32,
    /// In-flight claims older than this are treated as abandoned (seconds).
    pub claim_ttl_secs: i64,
    /// Cadence of the abandoned-claim sweep (ms).
    pub housekeeper_interval_ms: u64,
    /// Prefix for executor identities recorded as claim owners.
    pub worker_id_prefix: String,
}

impl WorkerConfig {
    /// Idle sleep between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Cadence of the abandoned-claim sweep and registry refresh.
    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }

    /// Age after which a claim counts as abandoned.
    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_ttl_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1_000,
            claim_batch_limit: 100,
            claim_ttl_secs: 300,
            housekeeper_interval_ms: 30_000,
            worker_id_prefix: "docmigrate".to_string(),
        }
    }
}

/// Retry budget and exponential backoff with jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per item when the job does not override it.
    pub max_attempts: u32,
    /// Delay after the first failed attempt (ms); doubles per attempt.
    pub backoff_base_ms: u64,
    /// Ceiling on any single delay (ms).
    pub backoff_max_ms: u64,
    /// Fraction of the anchor delay used as +- jitter span.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    /// Exponential anchor for the given attempt number (1-based), capped.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    /// Delay before a failed attempt becomes claimable again.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return Duration::ZERO;
        }

        let jitter_ratio = f64::from(self.jitter_ratio.max(0.0));
        let span = (anchor as f64 * jitter_ratio).min(self.backoff_max_ms as f64);
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(self.backoff_max_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }

        let unit: f64 = rand::rng().random();
        Duration::from_millis((lower + (upper - lower) * unit).round() as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Defaults for jobs that leave a knob unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    /// Concurrency cap.
    pub concurrency: u32,
    /// Items per claim.
    pub batch_size: u32,
    /// Default `created_by` when a request leaves it empty.
    pub created_by: String,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 100,
            created_by: "system".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let retry = RetryConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(retry.base_delay_ms(0), 0);
        assert_eq!(retry.base_delay_ms(1), 1_000);
        assert_eq!(retry.base_delay_ms(2), 2_000);
        assert_eq!(retry.base_delay_ms(3), 4_000);
        assert_eq!(retry.base_delay_ms(4), 5_000);
        assert_eq!(retry.base_delay_ms(40), 5_000);
    }

    #[test]
    fn jitter_stays_within_span() {
        let retry = RetryConfig::default();
        for _ in 0..64 {
            let delay = retry.delay_for_attempt(2).as_millis() as u64;
            assert!((1_600..=2_400).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn zero_base_disables_backoff() {
        let retry = RetryConfig {
            backoff_base_ms: 0,
            ..Default::default()
        };
        assert_eq!(retry.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"worker":{"workers":2}}"#).expect("parse");
        assert_eq!(config.worker.workers, 2);
        assert_eq!(config.worker.poll_interval_ms, 1_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.jobs.concurrency, 5);
    }
}
