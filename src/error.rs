use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::channel::TaskExecutionError;

#[derive(Error, Debug)]
pub enum TaskfoldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid batching parameters: {0}")]
    InvalidPlan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote channel busy: lock not acquired within {0:?}")]
    ChannelBusy(Duration),

    #[error("Remote channel failure: {0}")]
    Channel(String),

    #[error("Scheduler query timed out after {0:?}")]
    SchedulerQueryTimeout(Duration),

    #[error("Scheduler command failed: {0}")]
    Scheduler(String),

    #[error("Backend unavailable after {attempts} attempts: {reason}")]
    BackendUnavailable { attempts: u32, reason: String },

    #[error("Forbidden payload type {namespace}/{type_name}")]
    ForbiddenPayloadType {
        namespace: String,
        type_name: String,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error(
        "Version mismatch: controller runs taskfold {local}, worker reports taskfold {remote}"
    )]
    VersionMismatch { local: String, remote: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TaskfoldError {
    /// Infrastructure errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskfoldError::ChannelBusy(_)
                | TaskfoldError::Channel(_)
                | TaskfoldError::SchedulerQueryTimeout(_)
        )
    }

    /// A worker that cannot be trusted at all; its whole job is rejected.
    pub fn is_trust_violation(&self) -> bool {
        matches!(
            self,
            TaskfoldError::ForbiddenPayloadType { .. } | TaskfoldError::VersionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskfoldError>;

/// Why a single task did not produce a value.
///
/// Job-level failures (rejected payloads, version mismatch, cancellation)
/// are fanned out to every task of the affected job.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskFailure {
    #[error(transparent)]
    Execution(TaskExecutionError),

    #[error("Task produced no output file")]
    MissingOutput,

    #[error("Task output rejected: {0}")]
    Rejected(String),

    #[error("Version mismatch: controller {local}, worker {remote}")]
    VersionMismatch { local: String, remote: String },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task timed out")]
    TimedOut,

    #[error("Backend failure: {0}")]
    Backend(String),
}

impl From<&TaskfoldError> for TaskFailure {
    fn from(err: &TaskfoldError) -> Self {
        match err {
            TaskfoldError::VersionMismatch { local, remote } => TaskFailure::VersionMismatch {
                local: local.clone(),
                remote: remote.clone(),
            },
            TaskfoldError::ForbiddenPayloadType { .. } | TaskfoldError::MalformedPayload(_) => {
                TaskFailure::Rejected(err.to_string())
            }
            TaskfoldError::Cancelled => TaskFailure::Cancelled,
            other => TaskFailure::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TaskfoldError::Channel("reset".into()).is_transient());
        assert!(TaskfoldError::ChannelBusy(Duration::from_secs(1)).is_transient());
        assert!(TaskfoldError::SchedulerQueryTimeout(Duration::from_secs(1)).is_transient());
        assert!(!TaskfoldError::Config("bad".into()).is_transient());
        assert!(!TaskfoldError::Cancelled.is_transient());
    }

    #[test]
    fn trust_violations_are_not_transient() {
        let err = TaskfoldError::ForbiddenPayloadType {
            namespace: "os".into(),
            type_name: "system".into(),
        };
        assert!(err.is_trust_violation());
        assert!(!err.is_transient());
        assert!(!TaskfoldError::MalformedPayload("truncated".into()).is_trust_violation());
    }

    #[test]
    fn version_mismatch_names_both_versions() {
        let err = TaskfoldError::VersionMismatch {
            local: "0.1.0".into(),
            remote: "0.2.0".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.1.0"));
        assert!(msg.contains("0.2.0"));
    }

    #[test]
    fn task_failure_projection() {
        let forbidden = TaskfoldError::ForbiddenPayloadType {
            namespace: "os".into(),
            type_name: "system".into(),
        };
        assert!(matches!(
            TaskFailure::from(&forbidden),
            TaskFailure::Rejected(msg) if msg.contains("os/system")
        ));
        assert_eq!(
            TaskFailure::from(&TaskfoldError::Cancelled),
            TaskFailure::Cancelled
        );
        assert!(matches!(
            TaskFailure::from(&TaskfoldError::MalformedPayload("too big".into())),
            TaskFailure::Rejected(_)
        ));
    }
}
