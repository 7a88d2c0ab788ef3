//! Error types for Cadence.

use crate::operation::StatusCategory;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Pipeline '{0}' not found.")]
    PipelineNotFound(String),

    #[error("Pipeline '{name}' with counter '{counter}' not found.")]
    InstanceNotFound { name: String, counter: String },

    #[error("Stage '{0}' not found.")]
    StageNotFound(String),

    #[error("Job '{0}' not found.")]
    JobNotFound(String),

    #[error("Material with fingerprint '{0}' not found.")]
    MaterialNotFound(String),

    // Permission errors
    #[error("{0}")]
    Unauthorized(String),

    // Scheduling preconditions
    #[error("Pipeline '{0}' is locked.")]
    Locked(String),

    #[error("Pipeline '{0}' is paused.")]
    Paused(String),

    #[error("{0}")]
    AlreadyInProgress(String),

    #[error("Cannot schedule {stage} as the previous stage {previous} has {state}!")]
    PreviousStageNotPassed {
        stage: String,
        previous: String,
        state: String,
    },

    #[error("Cannot schedule {stage} as the previous stage {previous} has not run!")]
    PreviousStageNotRan { stage: String, previous: String },

    #[error("Less than {required_mb}MB of disk space available ({available_mb}MB free).")]
    DiskFull { required_mb: u64, available_mb: u64 },

    #[error("Pipeline '{0}' has no material revisions to build from.")]
    NoModifications(String),

    // Topology
    #[error("{0}")]
    UnsupportedTopology(String),

    // Request errors
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Infrastructure errors
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Material poll failed: {0}")]
    Poll(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn instance_not_found(name: impl Into<String>, counter: impl ToString) -> Self {
        Error::InstanceNotFound {
            name: name.into(),
            counter: counter.to_string(),
        }
    }

    /// Transport-neutral category for this error.
    pub fn category(&self) -> StatusCategory {
        match self {
            Error::PipelineNotFound(_)
            | Error::InstanceNotFound { .. }
            | Error::StageNotFound(_)
            | Error::JobNotFound(_)
            | Error::MaterialNotFound(_) => StatusCategory::NotFound,
            Error::Unauthorized(_) => StatusCategory::Unauthorized,
            Error::Locked(_)
            | Error::Paused(_)
            | Error::AlreadyInProgress(_)
            | Error::PreviousStageNotPassed { .. }
            | Error::PreviousStageNotRan { .. }
            | Error::DiskFull { .. }
            | Error::NoModifications(_)
            | Error::InvalidTransition { .. } => StatusCategory::Conflict,
            Error::UnsupportedTopology(_) => StatusCategory::Unsupported,
            Error::InvalidRequest(_) => StatusCategory::BadRequest,
            Error::Repository(_)
            | Error::Poll(_)
            | Error::Serialization(_)
            | Error::Internal(_) => StatusCategory::Internal,
        }
    }

    /// Whether the error is a scheduling precondition rather than a fault.
    pub fn is_precondition(&self) -> bool {
        matches!(self.category(), StatusCategory::Conflict)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_not_found_message() {
        let err = Error::instance_not_found("p1", 7);
        assert_eq!(err.to_string(), "Pipeline 'p1' with counter '7' not found.");
        assert_eq!(err.category(), StatusCategory::NotFound);
    }

    #[test]
    fn test_previous_stage_message() {
        let err = Error::PreviousStageNotPassed {
            stage: "ft".to_string(),
            previous: "dev".to_string(),
            state: "Failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot schedule ft as the previous stage dev has Failed!"
        );
        assert!(err.is_precondition());
    }
}
