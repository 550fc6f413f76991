use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::command::{self, quote_path, shell_quote, CommandRunner};
use crate::backend::{collect_results, ExecutionBackend, JobFiles, JobLayout, TaskRef, TaskResult};
use crate::channel;
use crate::config::{BatchLimits, ControllerConfig, Profile, Resource, ResourceKind};
use crate::error::{Result, TaskfoldError};
use crate::scheduler::classifier::classify;
use crate::scheduler::job::{Job, JobHandle, JobState};
use crate::version::{VersionGuard, VersionReport};

struct SubmittedJob {
    layout: JobLayout,
    tasks: Vec<TaskRef>,
    last_state: JobState,
    missing_polls: u32,
    cancel_requested: bool,
}

pub struct SlurmBackend<R> {
    runner: R,
    kind: ResourceKind,
    resource: Resource,
    profile: Profile,
    worker: PathBuf,
    config: ControllerConfig,
    guard: VersionGuard,
    jobs: RwLock<HashMap<Uuid, SubmittedJob>>,
}

impl<R: CommandRunner> SlurmBackend<R> {
    pub fn with_runner(
        runner: R,
        resource: Resource,
        profile: Profile,
        config: ControllerConfig,
    ) -> Result<Self> {
        resource.validate()?;
        profile.validate_for(&resource)?;
        let local = VersionReport::current();
        let worker = resource.worker_for(&local.interpreter_key())?.to_path_buf();
        Ok(Self {
            runner,
            kind: resource.kind,
            resource,
            profile,
            worker,
            config,
            guard: VersionGuard::new(local),
            jobs: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_guard(mut self, guard: VersionGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn binary(&self, name: &str) -> String {
        self.resource
            .option(name)
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string())
    }

    async fn query_squeue(&self, ids: &[&str]) -> Result<HashMap<String, String>> {
        let command = format!(
            "{} --noheader --format='%i %T' --jobs={}",
            self.binary("squeue"),
            ids.join(",")
        );
        let output = self.runner.run(&command, None).await?;
        if !output.success() {
            let stderr = output.stderr_str();
            // Raised when none of the ids is known any more
            if stderr.to_ascii_lowercase().contains("invalid job id") {
                return Ok(HashMap::new());
            }
            return Err(TaskfoldError::Scheduler(format!(
                "squeue failed with {:?}: {}",
                output.status, stderr
            )));
        }
        Ok(parse_squeue(&output.stdout_str()))
    }

    async fn query_sacct(&self, ids: &[&str]) -> HashMap<String, String> {
        let command = format!(
            "{} -n -P -X -o JobID,State --jobs={}",
            self.binary("sacct"),
            ids.join(",")
        );
        match self.runner.run(&command, None).await {
            Ok(output) if output.success() => parse_sacct(&output.stdout_str()),
            Ok(output) => {
                tracing::warn!(
                    status = ?output.status,
                    stderr = %output.stderr_str(),
                    "sacct query failed"
                );
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "sacct query failed");
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl<R: CommandRunner> ExecutionBackend for SlurmBackend<R> {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn batch_limits(&self) -> BatchLimits {
        self.resource.batching.clone()
    }

    async fn submit(&self, job: &Job) -> Result<JobHandle> {
        if job.tasks.is_empty() {
            return Err(TaskfoldError::Config(format!("job {} has no tasks", job.id)));
        }
        let layout = JobLayout::for_venue(&self.resource, &self.profile, job.id);
        command::make_dirs(&self.runner, &layout.dirs()).await?;

        for task in &job.tasks {
            let bytes = channel::encode_task_input(task)?;
            command::write_file(&self.runner, &layout.input_file(&task.label), &bytes).await?;
        }

        let script = render_script(job, &layout, &self.worker, &self.resource);
        command::write_file(&self.runner, &layout.script_file(), script.as_bytes()).await?;

        let output = command::run_checked_once(
            &self.runner,
            &format!(
                "{} --parsable {}",
                self.binary("sbatch"),
                quote_path(&layout.script_file())
            ),
            None,
        )
        .await?;
        let native_id = parse_sbatch(&output.stdout_str()).ok_or_else(|| {
            TaskfoldError::Scheduler(format!(
                "unexpected sbatch output: {:?}",
                output.stdout_str()
            ))
        })?;

        tracing::info!(
            job_id = %job.id,
            native_id = %native_id,
            venue = %self.runner.describe(),
            tasks = job.tasks.len(),
            parallel = job.request.parallel_tasks,
            "Submitted Slurm job"
        );

        self.jobs.write().await.insert(
            job.id,
            SubmittedJob {
                layout,
                tasks: job.tasks.iter().map(TaskRef::from).collect(),
                last_state: JobState::Pending,
                missing_polls: 0,
                cancel_requested: false,
            },
        );
        Ok(JobHandle {
            job_id: job.id,
            native_id,
        })
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<JobHandle, JobState>> {
        if handles.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<&str> = handles.iter().map(|h| h.native_id.as_str()).collect();
        let mut native = self.query_squeue(&ids).await?;

        let missing: Vec<&str> = ids
            .iter()
            .copied()
            .filter(|id| !native.contains_key(*id))
            .collect();
        if !missing.is_empty() {
            native.extend(self.query_sacct(&missing).await);
        }

        let mut jobs = self.jobs.write().await;
        let mut states = HashMap::with_capacity(handles.len());
        for handle in handles {
            let job = jobs
                .get_mut(&handle.job_id)
                .ok_or(TaskfoldError::JobNotFound(handle.job_id))?;

            let observed = match native.get(&handle.native_id) {
                Some(token) => {
                    job.missing_polls = 0;
                    classify(token)
                }
                None => {
                    job.missing_polls += 1;
                    if job.missing_polls >= self.config.missing_job_grace_polls {
                        tracing::warn!(
                            job_id = %handle.job_id,
                            native_id = %handle.native_id,
                            polls = job.missing_polls,
                            "Job vanished from the scheduler, declaring it failed"
                        );
                        JobState::FinishedError
                    } else {
                        job.last_state
                    }
                }
            };

            let state = if job.cancel_requested && observed.is_terminal() {
                JobState::Cancelled
            } else {
                observed
            };
            if !job.last_state.is_terminal() {
                job.last_state = state;
            }
            states.insert(handle.clone(), job.last_state);
        }
        Ok(states)
    }

    async fn fetch_results(&self, handle: &JobHandle) -> Result<Vec<TaskResult>> {
        let (layout, tasks) = {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(&handle.job_id)
                .ok_or(TaskfoldError::JobNotFound(handle.job_id))?;
            (job.layout.clone(), job.tasks.clone())
        };

        let mut files = JobFiles {
            version_report: command::read_file(&self.runner, &layout.version_file()).await?,
            outputs: Vec::with_capacity(tasks.len()),
        };
        for task in &tasks {
            files.outputs.push(
                command::read_file(&self.runner, &layout.output_file(&task.label)).await?,
            );
        }
        collect_results(
            handle.job_id,
            &tasks,
            files,
            &self.guard,
            self.config.max_payload_bytes,
        )
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(&handle.job_id)
                .ok_or(TaskfoldError::JobNotFound(handle.job_id))?;
            if job.last_state.is_terminal() || job.cancel_requested {
                return Ok(());
            }
            job.cancel_requested = true;
        }
        tracing::info!(job_id = %handle.job_id, native_id = %handle.native_id, "Cancelling Slurm job");
        command::run_checked_once(
            &self.runner,
            &format!("{} {}", self.binary("scancel"), shell_quote(&handle.native_id)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        let removed = self.jobs.write().await.remove(&handle.job_id);
        if let Some(job) = removed {
            if !self.config.keep_job_dirs {
                command::remove_dirs(&self.runner, &job.layout.dirs()).await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.runner.close().await
    }
}

/// Batch script: version report first, then the tasks in waves of
/// `parallel_tasks` concurrent `srun` steps.
pub fn render_script(job: &Job, layout: &JobLayout, worker: &Path, resource: &Resource) -> String {
    let request = &job.request;
    let parallel = request.parallel_tasks.max(1);
    let worker = quote_path(worker);

    let mut s = String::new();
    let _ = writeln!(s, "#!/bin/sh");
    let _ = writeln!(s, "#SBATCH --job-name=taskfold-{}", &job.id.simple().to_string()[..8]);
    let _ = writeln!(s, "#SBATCH --ntasks={}", parallel);
    let _ = writeln!(s, "#SBATCH --cpus-per-task={}", request.cpus_per_task);
    let _ = writeln!(s, "#SBATCH --mem={}M", request.total_mem_mb());
    if let Some(wall) = request.wall_time {
        let waves = job.tasks.len().div_ceil(parallel) as u32;
        let _ = writeln!(s, "#SBATCH --time={}", slurm_minutes(wall * waves));
    }
    for key in ["partition", "account", "qos", "constraint"] {
        if let Some(value) = resource.option(key) {
            let _ = writeln!(s, "#SBATCH --{}={}", key, value);
        }
    }
    let _ = writeln!(
        s,
        "#SBATCH --output={}",
        layout.job_dir.join("slurm-%j.out").display()
    );
    let _ = writeln!(
        s,
        "#SBATCH --error={}",
        layout.job_dir.join("slurm-%j.err").display()
    );
    if let Some(extra) = resource.option("extra_lines") {
        for line in extra.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let _ = writeln!(s, "{}", line);
        }
    }
    let _ = writeln!(s);
    let _ = writeln!(
        s,
        "{} version --output-file {} || exit 1",
        worker,
        quote_path(&layout.version_file())
    );

    for wave in job.tasks.chunks(parallel) {
        let _ = writeln!(s);
        for task in wave {
            let _ = writeln!(
                s,
                "srun --ntasks=1 --cpus-per-task={} --mem={}M {} run --input-file {} --output-file {} 2>> {} &",
                request.cpus_per_task,
                request.mem_per_task_mb,
                worker,
                quote_path(&layout.input_file(&task.label)),
                quote_path(&layout.output_file(&task.label)),
                quote_path(&layout.log_file(&task.label)),
            );
        }
        let _ = writeln!(s, "wait");
    }
    s
}

fn slurm_minutes(wall: Duration) -> u64 {
    wall.as_secs().div_ceil(60).max(1)
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
pub fn parse_sbatch(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Lines of `<id> <STATE>`.
pub fn parse_squeue(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.next()?;
            Some((id.to_string(), state.to_string()))
        })
        .collect()
}

/// Lines of `<id>|<STATE>`, as printed by `sacct -P`.
pub fn parse_sacct(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (id, state) = line.trim().split_once('|')?;
            let state = state.trim();
            if id.is_empty() || state.is_empty() {
                None
            } else {
                Some((id.to_string(), state.to_string()))
            }
        })
        .collect()
}
