//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors (fatal before any job runs)
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Dependency cycle detected: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    // Rule evaluation (contained: treated as a non-match)
    #[error("Rule evaluation failed for job {job}: {message}")]
    RuleEvaluation { job: String, message: String },

    // Job-level errors (contained to the instance)
    #[error("Job failed with exit code {exit_code}")]
    JobFailure { exit_code: i32 },

    #[error("Job timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Declared artifacts missing: {}", paths.join(", "))]
    ArtifactMissing { paths: Vec<String> },

    // Scheduler control errors
    #[error("pipeline is not interruptible")]
    NotInterruptible,

    #[error("Unknown job instance: {0}")]
    UnknownInstance(String),

    #[error("Invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("Scheduler is no longer running")]
    SchedulerClosed,

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error aborts the pipeline before scheduling starts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Cycle { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_names_chain() {
        let err = Error::Cycle {
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_interruptible_message() {
        assert_eq!(
            Error::NotInterruptible.to_string(),
            "pipeline is not interruptible"
        );
        assert!(!Error::NotInterruptible.is_fatal());
    }
}
