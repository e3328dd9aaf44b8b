//! Retry policy for failed job attempts.

use gantry_core::pipeline::{RetryConfig, RetryWhen};
use gantry_core::run::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max: u32,
    pub when: Vec<RetryWhen>,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        match config {
            RetryConfig::Count(max) => Self {
                max: *max,
                when: vec![RetryWhen::Always],
            },
            RetryConfig::Detailed { max, when } if when.is_empty() => Self {
                max: *max,
                when: vec![RetryWhen::Always],
            },
            RetryConfig::Detailed { max, when } => Self {
                max: *max,
                when: when.clone(),
            },
        }
    }

    /// Whether an instance that just failed its `attempts`-th attempt gets another.
    pub fn should_retry(&self, reason: &FailureReason, attempts: u32) -> bool {
        if attempts > self.max {
            return false;
        }
        if matches!(reason, FailureReason::NoMatchingRunner { .. }) {
            return false;
        }
        self.when.iter().any(|w| match w {
            RetryWhen::Always => true,
            RetryWhen::ScriptFailure => matches!(reason, FailureReason::ExitCode { .. }),
            RetryWhen::Timeout => matches!(reason, FailureReason::Timeout { .. }),
            RetryWhen::ArtifactsMissing => {
                matches!(reason, FailureReason::ArtifactsMissing { .. })
            }
            RetryWhen::RunnerFailure => matches!(reason, FailureReason::ExecutorError { .. }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_retries_everything() {
        let policy = RetryPolicy::from_config(&RetryConfig::Count(2));
        let reason = FailureReason::ExitCode { code: 1 };
        assert!(policy.should_retry(&reason, 1));
        assert!(policy.should_retry(&reason, 2));
        assert!(!policy.should_retry(&reason, 3));
    }

    #[test]
    fn test_when_filters_reasons() {
        let policy = RetryPolicy::from_config(&RetryConfig::Detailed {
            max: 1,
            when: vec![RetryWhen::Timeout],
        });
        assert!(policy.should_retry(&FailureReason::Timeout { seconds: 5 }, 1));
        assert!(!policy.should_retry(&FailureReason::ExitCode { code: 1 }, 1));
    }

    #[test]
    fn test_never_retries_unmatched_tags() {
        let policy = RetryPolicy::from_config(&RetryConfig::Count(2));
        let reason = FailureReason::NoMatchingRunner {
            tags: vec!["gpu".to_string()],
        };
        assert!(!policy.should_retry(&reason, 1));
        assert!(!RetryPolicy::none().should_retry(&FailureReason::ExitCode { code: 1 }, 1));
    }
}
