use thiserror::Error;

/// Core error type for the Quadra job engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Job instance not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Dispatch was attempted for a name with no registered definition
    #[error("Unknown job name: {0}")]
    UnknownJob(String),

    /// Two definitions were registered under the same name
    #[error("Duplicate job definition: {0}")]
    DuplicateJob(String),

    /// A recurring schedule failed validation at registration time
    #[error("Invalid schedule for job {name}: {reason}")]
    InvalidSchedule {
        /// Name of the job carrying the schedule
        name: String,
        /// Why the schedule was rejected
        reason: String,
    },

    /// Queue backend error
    #[error("Queue backend error: {0}")]
    BackendError(String),

    /// Illegal job state transition requested from the backend
    #[error("Invalid state transition for job {job_id}: {reason}")]
    InvalidTransition {
        /// Job the transition was requested for
        job_id: String,
        /// Why the transition was rejected
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Lifecycle error (start/stop misuse)
    #[error("Lifecycle error: {0}")]
    LifecycleError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

/// Handler failure taxonomy.
///
/// A handler either fails in a way that is worth retrying (transient
/// upstream timeouts, a prerequisite that a dispatched job will create)
/// or in a way that no retry can fix (malformed payload). Lock
/// contention is neither: a handler that loses a lock race should
/// return a successful "skipped" result, not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Transient failure; the runtime schedules a backoff retry while
    /// attempts remain
    #[error("Retryable job failure: {0}")]
    Retryable(String),

    /// Permanent failure; the job is marked failed without further
    /// attempts
    #[error("Fatal job failure: {0}")]
    Fatal(String),
}

impl JobError {
    /// Build a retryable failure
    pub fn retryable(msg: impl Into<String>) -> Self {
        JobError::Retryable(msg.into())
    }

    /// Build a fatal failure
    pub fn fatal(msg: impl Into<String>) -> Self {
        JobError::Fatal(msg.into())
    }

    /// Whether this failure should short-circuit remaining attempts
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::JobNotFound("j1".to_string()), "Job not found: j1"),
            (
                CoreError::UnknownJob("components:sync".to_string()),
                "Unknown job name: components:sync",
            ),
            (
                CoreError::DuplicateJob("components:sync".to_string()),
                "Duplicate job definition: components:sync",
            ),
            (
                CoreError::BackendError("lost".to_string()),
                "Queue backend error: lost",
            ),
            (CoreError::Other("other".to_string()), "other"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => assert!(msg.contains("expected")),
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_job_error_classification() {
        assert!(!JobError::retryable("upstream timeout").is_fatal());
        assert!(JobError::fatal("bad payload").is_fatal());
        assert_eq!(
            JobError::retryable("x").to_string(),
            "Retryable job failure: x"
        );
    }
}
