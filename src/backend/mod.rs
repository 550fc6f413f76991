//! Execution venues.

pub mod command;
pub mod layout;
pub mod local;
pub mod slurm;
pub mod ssh;
pub mod sudo;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::channel::{self, TaskValue};
use crate::config::{BatchLimits, ResourceKind};
use crate::error::{Result, TaskFailure, TaskfoldError};
use crate::scheduler::job::{Job, JobHandle, JobState, TaskSpec};
use crate::version::{VersionGuard, VersionReport};

pub use command::{CommandOutput, CommandRunner};
pub use layout::JobLayout;
pub use local::LocalBackend;
pub use slurm::SlurmBackend;
pub use ssh::{RemoteBackend, SharedChannel, SshConnection, SshRunner};
pub use sudo::{ImpersonatedBackend, SudoRunner};

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Batching limits configured for the venue.
    fn batch_limits(&self) -> BatchLimits {
        BatchLimits::default()
    }

    async fn submit(&self, job: &Job) -> Result<JobHandle>;

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<JobHandle, JobState>>;

    /// Per-task outcomes of a terminal job. Errors here concern the whole
    /// job (unreadable venue, version mismatch, forbidden payload).
    async fn fetch_results(&self, handle: &JobHandle) -> Result<Vec<TaskResult>>;

    /// Request cancellation; a no-op once the job is terminal.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Remove the job's files and forget it.
    async fn cleanup(&self, handle: &JobHandle) -> Result<()>;

    /// Release connections to the venue. The backend may reconnect if used
    /// again afterwards.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Identity of a task as far as result collection is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: Uuid,
    pub label: String,
}

impl From<&TaskSpec> for TaskRef {
    fn from(spec: &TaskSpec) -> Self {
        Self {
            id: spec.id,
            label: spec.label.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub label: String,
    pub job_id: Uuid,
    pub outcome: std::result::Result<TaskValue, TaskFailure>,
}

impl TaskResult {
    pub fn failed(job_id: Uuid, task: &TaskRef, failure: TaskFailure) -> Self {
        Self {
            task_id: task.id,
            label: task.label.clone(),
            job_id,
            outcome: Err(failure),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Raw files read back from a job's venue.
#[derive(Debug, Default)]
pub struct JobFiles {
    pub version_report: Option<Vec<u8>>,
    /// One entry per task, in task order
    pub outputs: Vec<Option<Vec<u8>>>,
}

/// Validate the worker's version, then decode every task output.
///
/// A version mismatch or a forbidden payload type rejects the whole job. An
/// output that is merely malformed or oversized fails its own task.
pub fn collect_results(
    job_id: Uuid,
    tasks: &[TaskRef],
    files: JobFiles,
    guard: &VersionGuard,
    max_payload_bytes: usize,
) -> Result<Vec<TaskResult>> {
    if files.outputs.len() != tasks.len() {
        return Err(TaskfoldError::MalformedPayload(format!(
            "job {} has {} tasks but {} output slots",
            job_id,
            tasks.len(),
            files.outputs.len()
        )));
    }

    match files.version_report {
        Some(bytes) => {
            let remote = VersionReport::decode(&bytes, max_payload_bytes)?;
            guard.check(&remote)?;
        }
        None if files.outputs.iter().all(Option::is_none) => {
            // The job died before reporting its version; nothing to trust or decode
            tracing::warn!(job_id = %job_id, "Job left neither version report nor outputs");
            return Ok(tasks
                .iter()
                .map(|t| TaskResult::failed(job_id, t, TaskFailure::MissingOutput))
                .collect());
        }
        None => {
            return Err(TaskfoldError::MalformedPayload(format!(
                "job {} produced outputs without a version report",
                job_id
            )));
        }
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (task, output) in tasks.iter().zip(files.outputs) {
        let outcome = match output {
            None => Err(TaskFailure::MissingOutput),
            Some(bytes) => match channel::decode_task_output(&bytes, max_payload_bytes) {
                Ok(output) => output.into_result().map_err(TaskFailure::Execution),
                Err(e) if e.is_trust_violation() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        task_id = %task.id,
                        error = %e,
                        "Rejected task output"
                    );
                    Err(TaskFailure::from(&e))
                }
            },
        };
        results.push(TaskResult {
            task_id: task.id,
            label: task.label.clone(),
            job_id,
            outcome,
        });
    }
    Ok(results)
}
