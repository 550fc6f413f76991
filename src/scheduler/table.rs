use std::collections::HashMap;

use uuid::Uuid;

use crate::scheduler::job::{Job, JobHandle, JobState};

/// Tracks the jobs of one batch and their observed states
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<Uuid, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Apply an observed state, ignoring anything after a terminal state.
    /// Returns whether the stored state changed.
    pub fn record_state(&mut self, id: &Uuid, state: JobState) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) => {
                let changed = job.record_state(state);
                if changed {
                    tracing::info!(job_id = %id, state = %state, "Job state changed");
                }
                changed
            }
            None => false,
        }
    }

    /// Handles of submitted jobs that have not reached a terminal state
    pub fn active_handles(&self) -> Vec<JobHandle> {
        self.jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .filter_map(Job::handle)
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.values().all(|j| j.state.is_terminal())
    }
}
