//! Retry supervision for pipeline steps.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use tracing::{debug, warn};

/// Which retry budget a step runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Data-moving and schema steps.
    Sync,
    /// Cheap status or metadata queries.
    Lightweight,
}

/// Runs fallible steps with bounded, backed-off retries of transient errors.
///
/// Fatal errors are returned on the first occurrence. When the budget is
/// exhausted the last error is returned unchanged, so its message reaches the
/// job record verbatim.
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    sync: RetryConfig,
    lightweight: RetryConfig,
}

impl RetrySupervisor {
    /// Creates a supervisor with the two budgets.
    pub fn new(sync: RetryConfig, lightweight: RetryConfig) -> Self {
        Self { sync, lightweight }
    }

    /// Returns the budget for a class.
    pub fn config(&self, class: RetryClass) -> &RetryConfig {
        match class {
            RetryClass::Sync => &self.sync,
            RetryClass::Lightweight => &self.lightweight,
        }
    }

    /// Runs `f` until it succeeds, fails fatally or the budget runs out.
    ///
    /// `f` receives the attempt number, starting at 1.
    pub fn run<T, F>(&self, class: RetryClass, step: &str, mut f: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> SyncResult<T>,
    {
        let config = self.config(class);
        let max_attempts = config.max_attempts();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = config.delay_for_attempt(attempt);
                debug!(step, attempt = attempt + 1, ?delay, "waiting before retry");
                std::thread::sleep(delay);
            }

            match f(attempt + 1) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.is_retryable() && attempt + 1 < max_attempts {
                        warn!(
                            step,
                            attempt = attempt + 1,
                            max_attempts,
                            error = %e,
                            "transient failure, retrying"
                        );
                        last_error = Some(e);
                        continue;
                    }
                    if e.is_retryable() {
                        warn!(step, attempts = max_attempts, error = %e, "retry budget exhausted");
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SyncError::InvalidRequest(format!("{step}: no attempts made"))))
    }
}

impl Default for RetrySupervisor {
    fn default() -> Self {
        Self::new(RetryConfig::sync(), RetryConfig::lightweight())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn instant(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::ZERO)
            .with_jitter(false)
    }

    fn supervisor() -> RetrySupervisor {
        RetrySupervisor::new(instant(3), instant(1))
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = Vec::new();
        let result = supervisor().run(RetryClass::Sync, "export", |attempt| {
            calls.push(attempt);
            if attempt <= 2 {
                Err(SyncError::SourceUnavailable(format!("blip {attempt}")))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, [1, 2, 3]);
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let mut calls = 0;
        let err = supervisor()
            .run(RetryClass::Sync, "export", |attempt| -> SyncResult<()> {
                calls += 1;
                Err(SyncError::SourceUnavailable(format!("failure {attempt}")))
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert_eq!(err.to_string(), "source unavailable: failure 4");
    }

    #[test]
    fn fatal_errors_bypass_retry() {
        let mut calls = 0;
        let err = supervisor()
            .run(RetryClass::Sync, "auth", |_| -> SyncResult<()> {
                calls += 1;
                Err(SyncError::AuthenticationFailed("bad password".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    }

    #[test]
    fn lightweight_budget_is_smaller() {
        let mut calls = 0;
        let _ = supervisor().run(RetryClass::Lightweight, "stats", |_| -> SyncResult<()> {
            calls += 1;
            Err(SyncError::Timeout("slow".into()))
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn no_retry_runs_once() {
        let supervisor = RetrySupervisor::new(RetryConfig::no_retry(), RetryConfig::no_retry());
        let mut calls = 0;
        let _ = supervisor.run(RetryClass::Sync, "load", |_| -> SyncResult<()> {
            calls += 1;
            Err(SyncError::LockContention("busy".into()))
        });
        assert_eq!(calls, 1);
    }
}
