//! Drives one batch of tasks through an [`ExecutionBackend`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ExecutionBackend, TaskRef, TaskResult};
use crate::config::{BatchLimits, ControllerConfig};
use crate::error::{Result, TaskFailure, TaskfoldError};
use crate::retry::{retry_transient, PollBackoff, RetryPolicy};
use crate::scheduler::job::{Job, JobHandle, JobState, TaskRequirements, TaskSpec};
use crate::scheduler::planner;
use crate::scheduler::table::JobTable;

/// Why the controller stopped waiting for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
struct Control {
    deadline: Option<Instant>,
    stop: Option<Stop>,
    /// Poll cycles a stopped job may take to reach a terminal state
    grace_left: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub native_id: Option<String>,
    pub state: JobState,
    pub task_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobSummary>,
    /// One entry per task, in submission order
    pub results: Vec<TaskResult>,
}

impl BatchReport {
    pub fn result_for(&self, task_id: Uuid) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| r.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }
}

pub struct Controller<B: ?Sized> {
    backend: Arc<B>,
    config: ControllerConfig,
    retry: RetryPolicy,
}

impl<B: ExecutionBackend + ?Sized> Controller<B> {
    pub fn new(backend: Arc<B>, config: ControllerConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            backend,
            config,
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// [`run`](Self::run) with the batching limits of the backend's resource.
    pub async fn run_with_resource_limits(
        &self,
        tasks: Vec<TaskSpec>,
        needs: &TaskRequirements,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        let limits = self.backend.batch_limits();
        self.run(tasks, needs, &limits, cancel).await
    }

    pub async fn run(
        &self,
        tasks: Vec<TaskSpec>,
        needs: &TaskRequirements,
        limits: &BatchLimits,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        if tasks.is_empty() {
            return Ok(BatchReport::default());
        }

        let plan = planner::plan(tasks.len(), needs, limits)?;
        let jobs = planner::split_into_jobs(tasks, &plan, needs)?;
        tracing::info!(
            backend = %self.backend.kind(),
            jobs = jobs.len(),
            tasks_per_job = plan.tasks_per_job,
            parallel_tasks_per_job = plan.parallel_tasks_per_job,
            "Planned batch"
        );

        let mut table = JobTable::new();
        let mut order = Vec::with_capacity(jobs.len());
        let mut control = HashMap::with_capacity(jobs.len());

        for mut job in jobs {
            order.push(job.id);
            let stop = match self.submit(&job, &cancel).await {
                Ok(handle) => {
                    job.mark_submitted(&handle);
                    None
                }
                Err(TaskfoldError::Cancelled) => {
                    job.record_state(JobState::Cancelled);
                    Some(Stop::Cancelled)
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Submission failed, aborting batch");
                    self.abort(&table).await;
                    return Err(e);
                }
            };
            control.insert(
                job.id,
                Control {
                    deadline: self.config.job_timeout.map(|t| Instant::now() + t),
                    stop,
                    grace_left: self.config.max_attempts,
                },
            );
            table.add_job(job);
        }

        self.wait_for_jobs(&mut table, &mut control, &cancel).await?;
        Ok(self.collect(&table, &order, &control).await)
    }

    async fn submit(&self, job: &Job, cancel: &CancellationToken) -> Result<JobHandle> {
        retry_transient(&self.retry, "submit", cancel, || self.backend.submit(job)).await
    }

    async fn wait_for_jobs(
        &self,
        table: &mut JobTable,
        control: &mut HashMap<Uuid, Control>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = PollBackoff::from_config(&self.config);
        let mut consecutive_failures = 0u32;
        let mut cancel_handled = false;

        while !table.all_terminal() {
            let delay = backoff.next_delay();
            if cancel_handled {
                tokio::time::sleep(delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }

            if !cancel_handled && cancel.is_cancelled() {
                cancel_handled = true;
                tracing::info!("Batch cancelled, cancelling outstanding jobs");
                for handle in table.active_handles() {
                    self.stop_job(&handle, control, Stop::Cancelled).await;
                }
            }

            let now = Instant::now();
            for handle in table.active_handles() {
                let overdue = control.get(&handle.job_id).is_some_and(|c| {
                    c.stop.is_none() && c.deadline.is_some_and(|d| now >= d)
                });
                if overdue {
                    tracing::warn!(job_id = %handle.job_id, native_id = %handle.native_id, "Job exceeded its wall-clock budget");
                    self.stop_job(&handle, control, Stop::TimedOut).await;
                }
            }

            let active = table.active_handles();
            if active.is_empty() {
                break;
            }

            let polled =
                match tokio::time::timeout(self.config.poll_cycle_timeout, self.backend.poll(&active))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TaskfoldError::SchedulerQueryTimeout(
                        self.config.poll_cycle_timeout,
                    )),
                };

            match polled {
                Ok(states) => {
                    consecutive_failures = 0;
                    for (handle, state) in states {
                        table.record_state(&handle.job_id, state);
                    }
                }
                Err(e) if e.is_transient() || matches!(e, TaskfoldError::Scheduler(_)) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        attempt = consecutive_failures,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Poll cycle failed"
                    );
                    if consecutive_failures >= self.config.max_attempts {
                        self.abort(table).await;
                        return Err(TaskfoldError::BackendUnavailable {
                            attempts: consecutive_failures,
                            reason: e.to_string(),
                        });
                    }
                }
                Err(e) => {
                    self.abort(table).await;
                    return Err(e);
                }
            }

            // Stopped jobs that never acknowledge are given up on
            for handle in table.active_handles() {
                let Some(c) = control.get_mut(&handle.job_id) else {
                    continue;
                };
                if c.stop.is_some() {
                    c.grace_left = c.grace_left.saturating_sub(1);
                    if c.grace_left == 0 {
                        tracing::warn!(job_id = %handle.job_id, "Stopped job never reached a terminal state");
                        table.record_state(&handle.job_id, JobState::Cancelled);
                    }
                }
            }
        }
        Ok(())
    }

    async fn stop_job(&self, handle: &JobHandle, control: &mut HashMap<Uuid, Control>, why: Stop) {
        if let Some(c) = control.get_mut(&handle.job_id) {
            if c.stop.is_some() {
                return;
            }
            c.stop = Some(why);
        }
        if let Err(e) = self.backend.cancel(handle).await {
            tracing::warn!(job_id = %handle.job_id, native_id = %handle.native_id, error = %e, "Cancel request failed");
        }
    }

    /// Best-effort cancel and cleanup of every submitted, unfinished job.
    async fn abort(&self, table: &JobTable) {
        for handle in table.active_handles() {
            if let Err(e) = self.backend.cancel(&handle).await {
                tracing::warn!(job_id = %handle.job_id, error = %e, "Cancel during abort failed");
            }
            if let Err(e) = self.backend.cleanup(&handle).await {
                tracing::warn!(job_id = %handle.job_id, error = %e, "Cleanup during abort failed");
            }
        }
    }

    async fn collect(
        &self,
        table: &JobTable,
        order: &[Uuid],
        control: &HashMap<Uuid, Control>,
    ) -> BatchReport {
        // Jobs that finished before a cancellation still deliver their results
        let detached = CancellationToken::new();
        let mut report = BatchReport::default();

        for id in order {
            let Some(job) = table.get_job(id) else {
                continue;
            };
            let refs: Vec<TaskRef> = job.tasks.iter().map(TaskRef::from).collect();
            let fan_out = |failure: TaskFailure| -> Vec<TaskResult> {
                refs.iter()
                    .map(|t| TaskResult::failed(job.id, t, failure.clone()))
                    .collect()
            };

            let handle = job.handle();
            let stop = control.get(id).and_then(|c| c.stop);
            let results = match (&handle, stop) {
                (_, Some(Stop::Cancelled)) => fan_out(TaskFailure::Cancelled),
                (_, Some(Stop::TimedOut)) => fan_out(TaskFailure::TimedOut),
                (None, None) => fan_out(TaskFailure::Backend("job was never submitted".into())),
                (Some(handle), None) => {
                    match retry_transient(&self.retry, "fetch_results", &detached, || {
                        self.backend.fetch_results(handle)
                    })
                    .await
                    {
                        Ok(results) => results,
                        Err(e) => {
                            tracing::warn!(
                                job_id = %job.id,
                                native_id = %handle.native_id,
                                error = %e,
                                "Rejecting job results"
                            );
                            fan_out(TaskFailure::from(&e))
                        }
                    }
                }
            };

            if let Some(ref handle) = handle {
                if let Err(e) = self.backend.cleanup(handle).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Job cleanup failed");
                }
            }

            tracing::info!(
                job_id = %job.id,
                state = %job.state,
                succeeded = results.iter().filter(|r| r.is_ok()).count(),
                tasks = results.len(),
                "Collected job results"
            );
            report.jobs.push(JobSummary {
                job_id: job.id,
                native_id: job.native_id.clone(),
                state: job.state,
                task_ids: job.tasks.iter().map(|t| t.id).collect(),
            });
            report.results.extend(results);
        }
        report
    }
}
