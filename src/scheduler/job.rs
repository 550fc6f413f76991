use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::TaskValue;

/// Canonical job state, independent of any scheduler's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    FinishedOk,
    FinishedError,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::FinishedOk | JobState::FinishedError | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::FinishedOk => write!(f, "finished_ok"),
            JobState::FinishedError => write!(f, "finished_error"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Program a worker hands the task payload to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// One independent unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: Uuid,
    /// File stem for the task's input/output files, unique within a job
    pub label: String,
    pub entry_point: EntryPoint,
    pub payload: TaskValue,
}

impl TaskSpec {
    pub fn new(entry_point: EntryPoint, payload: TaskValue) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            label: format!("task-{}", id.simple()),
            entry_point,
            payload,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Per-task resource needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub cpus_per_task: u32,
    pub mem_per_task_mb: u64,
    #[serde(default)]
    pub wall_time: Option<Duration>,
}

impl Default for TaskRequirements {
    fn default() -> Self {
        Self {
            cpus_per_task: 1,
            mem_per_task_mb: 1_000,
            wall_time: None,
        }
    }
}

impl TaskRequirements {
    pub fn new(cpus_per_task: u32, mem_per_task_mb: u64) -> Self {
        Self {
            cpus_per_task,
            mem_per_task_mb,
            wall_time: None,
        }
    }

    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time = Some(wall_time);
        self
    }
}

/// What a job asks its venue for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus_per_task: u32,
    pub mem_per_task_mb: u64,
    /// Tasks of the job allowed to run at the same time
    pub parallel_tasks: usize,
    pub wall_time: Option<Duration>,
}

impl ResourceRequest {
    pub fn total_cpus(&self) -> u64 {
        self.cpus_per_task as u64 * self.parallel_tasks as u64
    }

    pub fn total_mem_mb(&self) -> u64 {
        self.mem_per_task_mb * self.parallel_tasks as u64
    }
}

/// Identifies a submitted job towards its backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    /// Scheduler-assigned identifier
    pub native_id: String,
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.job_id, self.native_id)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub tasks: Vec<TaskSpec>,
    pub request: ResourceRequest,
    pub state: JobState,
    pub native_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(tasks: Vec<TaskSpec>, request: ResourceRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            tasks,
            request,
            state: JobState::Pending,
            native_id: None,
            created_at: Utc::now(),
            submitted_at: None,
            finished_at: None,
        }
    }

    pub fn handle(&self) -> Option<JobHandle> {
        self.native_id.as_ref().map(|native_id| JobHandle {
            job_id: self.id,
            native_id: native_id.clone(),
        })
    }

    pub fn mark_submitted(&mut self, handle: &JobHandle) {
        self.native_id = Some(handle.native_id.clone());
        self.submitted_at = Some(Utc::now());
    }

    /// Apply an observed state. A terminal state is final: later
    /// observations are ignored. Returns whether the state changed.
    pub fn record_state(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() {
            if state != self.state {
                tracing::debug!(
                    job_id = %self.id,
                    current = %self.state,
                    observed = %state,
                    "Ignoring state observation after terminal state"
                );
            }
            return false;
        }
        if self.state == state {
            return false;
        }
        self.state = state;
        if state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}
