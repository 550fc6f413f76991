use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{collect_results, ExecutionBackend, JobFiles, JobLayout, TaskRef, TaskResult};
use crate::channel;
use crate::config::{BatchLimits, ControllerConfig, Profile, Resource, ResourceKind};
use crate::error::{Result, TaskfoldError};
use crate::scheduler::job::{Job, JobHandle, JobState};
use crate::version::{VersionGuard, VersionReport};

struct LocalJob {
    layout: JobLayout,
    tasks: Vec<TaskRef>,
    state: watch::Receiver<JobState>,
    cancel: CancellationToken,
}

/// Runs worker processes directly on the controller host.
///
/// Each job becomes a tokio task that writes the version report and then
/// runs the job's tasks, at most `parallel_tasks` at a time. Job state
/// comes from the exit status of those processes.
pub struct LocalBackend {
    worker: PathBuf,
    job_root: PathBuf,
    task_root: PathBuf,
    limits: BatchLimits,
    config: ControllerConfig,
    guard: VersionGuard,
    jobs: Arc<RwLock<HashMap<Uuid, LocalJob>>>,
}

impl LocalBackend {
    pub fn new(resource: &Resource, profile: &Profile, config: ControllerConfig) -> Result<Self> {
        if resource.kind != ResourceKind::Local {
            return Err(TaskfoldError::Config(format!(
                "resource {} is {}, not local",
                resource.name, resource.kind
            )));
        }
        resource.validate()?;
        profile.validate_for(resource)?;

        let local = VersionReport::current();
        let worker = resource.worker_for(&local.interpreter_key())?.to_path_buf();
        let (job_root, task_root) = JobLayout::roots(resource, profile);
        Ok(Self {
            worker,
            job_root,
            task_root,
            limits: resource.batching.clone(),
            config,
            guard: VersionGuard::new(local),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_guard(mut self, guard: VersionGuard) -> Self {
        self.guard = guard;
        self
    }

    async fn run_job(
        worker: PathBuf,
        layout: JobLayout,
        tasks: Vec<TaskRef>,
        parallel: usize,
        cancel: CancellationToken,
        state: watch::Sender<JobState>,
    ) {
        let job_dir = layout.job_dir.display().to_string();
        let _ = state.send(JobState::Running);

        let work = async {
            let version_ok = Self::run_process(
                Command::new(&worker)
                    .arg("version")
                    .arg("--output-file")
                    .arg(layout.version_file()),
                &layout.job_dir.join("version.log"),
            )
            .await;
            if !version_ok {
                return false;
            }

            let results: Vec<bool> = stream::iter(tasks.iter().cloned())
                .map(|task: TaskRef| {
                    let mut cmd = Command::new(&worker);
                    cmd.arg("run")
                        .arg("--input-file")
                        .arg(layout.input_file(&task.label))
                        .arg("--output-file")
                        .arg(layout.output_file(&task.label));
                    let log = layout.log_file(&task.label);
                    async move { Self::run_process(&mut cmd, &log).await }
                })
                .buffer_unordered(parallel.max(1))
                .collect()
                .await;
            results.into_iter().all(|ok| ok)
        };

        // Dropping `work` kills running children (kill_on_drop)
        let final_state = tokio::select! {
            ok = work => if ok { JobState::FinishedOk } else { JobState::FinishedError },
            _ = cancel.cancelled() => JobState::Cancelled,
        };
        tracing::info!(job_dir = %job_dir, state = %final_state, "Local job finished");
        let _ = state.send(final_state);
    }

    async fn run_process(cmd: &mut Command, log: &Path) -> bool {
        let stderr = match tokio::fs::File::create(log).await {
            Ok(file) => Stdio::from(file.into_std().await),
            Err(e) => {
                tracing::warn!(log = %log.display(), error = %e, "Cannot create log file");
                Stdio::null()
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true);
        match cmd.status().await {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn worker");
                false
            }
        }
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Local
    }

    fn batch_limits(&self) -> BatchLimits {
        self.limits.clone()
    }

    async fn submit(&self, job: &Job) -> Result<JobHandle> {
        if job.tasks.is_empty() {
            return Err(TaskfoldError::Config(format!("job {} has no tasks", job.id)));
        }
        let layout = JobLayout::new(&self.job_root, &self.task_root, job.id);
        for dir in layout.dirs() {
            tokio::fs::create_dir_all(dir).await?;
        }
        for task in &job.tasks {
            let bytes = channel::encode_task_input(task)?;
            tokio::fs::write(layout.input_file(&task.label), bytes).await?;
        }

        let tasks: Vec<TaskRef> = job.tasks.iter().map(TaskRef::from).collect();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(JobState::Pending);

        tokio::spawn(Self::run_job(
            self.worker.clone(),
            layout.clone(),
            tasks.clone(),
            job.request.parallel_tasks,
            cancel.clone(),
            state_tx,
        ));

        self.jobs.write().await.insert(
            job.id,
            LocalJob {
                layout,
                tasks,
                state: state_rx,
                cancel,
            },
        );
        tracing::info!(
            job_id = %job.id,
            tasks = job.tasks.len(),
            parallel = job.request.parallel_tasks,
            "Submitted local job"
        );
        Ok(JobHandle {
            job_id: job.id,
            native_id: job.id.to_string(),
        })
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<JobHandle, JobState>> {
        let jobs = self.jobs.read().await;
        let mut states = HashMap::with_capacity(handles.len());
        for handle in handles {
            let job = jobs
                .get(&handle.job_id)
                .ok_or(TaskfoldError::JobNotFound(handle.job_id))?;
            let state = *job.state.borrow();
            states.insert(handle.clone(), state);
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
            version_report: Self::read_optional(&layout.version_file()).await?,
            outputs: Vec::with_capacity(tasks.len()),
        };
        for task in &tasks {
            files
                .outputs
                .push(Self::read_optional(&layout.output_file(&task.label)).await?);
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
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(&handle.job_id)
            .ok_or(TaskfoldError::JobNotFound(handle.job_id))?;
        if job.state.borrow().is_terminal() {
            return Ok(());
        }
        tracing::info!(job_id = %handle.job_id, "Cancelling local job");
        job.cancel.cancel();
        Ok(())
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        let removed = self.jobs.write().await.remove(&handle.job_id);
        if let Some(job) = removed {
            job.cancel.cancel();
            if !self.config.keep_job_dirs {
                for dir in job.layout.dirs() {
                    match tokio::fs::remove_dir_all(dir).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }
}
