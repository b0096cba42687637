//! Configuration for the sync engine.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for staged files.
    pub staging_dir: PathBuf,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum rows per export chunk.
    pub chunk_size: usize,
    /// Retry budget for schema and transport steps.
    pub sync_retry: RetryConfig,
    /// Retry budget for status-query steps.
    pub lightweight_retry: RetryConfig,
    /// Stale job reaper settings.
    pub reaper: ReaperConfig,
    /// Retention sweeper settings.
    pub retention: RetentionConfig,
    /// Reject submissions for tables missing from the active allow-list.
    pub require_registered_tables: bool,
}

impl EngineConfig {
    /// Creates a configuration staging files under `staging_dir`.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            workers: 4,
            chunk_size: 10_000,
            sync_retry: RetryConfig::sync(),
            lightweight_retry: RetryConfig::lightweight(),
            reaper: ReaperConfig::default(),
            retention: RetentionConfig::default(),
            require_registered_tables: false,
        }
    }

    /// Sets the number of worker threads (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the export chunk size (at least one row).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sets the retry budget for sync-class steps.
    pub fn with_sync_retry(mut self, retry: RetryConfig) -> Self {
        self.sync_retry = retry;
        self
    }

    /// Sets the retry budget for lightweight steps.
    pub fn with_lightweight_retry(mut self, retry: RetryConfig) -> Self {
        self.lightweight_retry = retry;
        self
    }

    /// Sets the reaper configuration.
    pub fn with_reaper(mut self, reaper: ReaperConfig) -> Self {
        self.reaper = reaper;
        self
    }

    /// Sets the retention configuration.
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Requires tables to be registered before they can be synced.
    pub fn with_required_registration(mut self, required: bool) -> Self {
        self.require_registered_tables = required;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Budget for schema reconciliation and data transport.
    pub fn sync() -> Self {
        Self::new(3)
    }

    /// Budget for simple status queries.
    pub fn lightweight() -> Self {
        Self::new(1)
            .with_initial_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(2))
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier. Values below 1.0 are raised to 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // A negative product collapses to zero.
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.jitter && delay_secs > 0.0 {
            // Up to 25% on top of the capped delay
            let jitter = delay_secs * rand::thread_rng().gen_range(0.0..=0.25);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::sync()
    }
}

/// Configuration for the stale job reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// A running job with no activity for this long is failed.
    pub liveness_threshold: Duration,
}

impl ReaperConfig {
    /// Sets the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the liveness threshold.
    pub fn with_liveness_threshold(mut self, threshold: Duration) -> Self {
        self.liveness_threshold = threshold;
        self
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            liveness_threshold: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for the retention sweeper.
///
/// Each category is swept on its own interval.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How long completed job records are kept.
    pub completed_jobs: Duration,
    /// How long failed job records are kept.
    pub failed_jobs: Duration,
    /// How long orphaned staging directories are kept.
    pub staged_files: Duration,
    /// Time between completed-job sweeps.
    pub completed_interval: Duration,
    /// Time between failed-job sweeps.
    pub failed_interval: Duration,
    /// Time between staging sweeps.
    pub staging_interval: Duration,
}

impl RetentionConfig {
    /// Sets the completed-job retention window.
    pub fn with_completed_jobs(mut self, window: Duration) -> Self {
        self.completed_jobs = window;
        self
    }

    /// Sets the failed-job retention window.
    pub fn with_failed_jobs(mut self, window: Duration) -> Self {
        self.failed_jobs = window;
        self
    }

    /// Sets the staged-file retention window.
    pub fn with_staged_files(mut self, window: Duration) -> Self {
        self.staged_files = window;
        self
    }

    /// Sets all three sweep intervals at once.
    pub fn with_intervals(mut self, interval: Duration) -> Self {
        self.completed_interval = interval;
        self.failed_interval = interval;
        self.staging_interval = interval;
        self
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        const HOUR: u64 = 60 * 60;
        Self {
            completed_jobs: Duration::from_secs(24 * HOUR),
            failed_jobs: Duration::from_secs(72 * HOUR),
            staged_files: Duration::from_secs(6 * HOUR),
            completed_interval: Duration::from_secs(HOUR),
            failed_interval: Duration::from_secs(6 * HOUR),
            staging_interval: Duration::from_secs(30 * 60),
        }
    }
}
