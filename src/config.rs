use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskfoldError};

/// Tuning knobs for the polling controller and the backends it drives.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// First delay between two scheduler queries
    pub poll_interval_initial: Duration,
    /// Upper bound for the delay between scheduler queries
    pub poll_interval_max: Duration,
    /// Growth factor applied to the poll delay after every cycle
    pub poll_backoff_multiplier: f64,
    /// Maximum duration of a single poll cycle
    pub poll_cycle_timeout: Duration,
    /// Wall-clock budget for one job, from submission to terminal state
    pub job_timeout: Option<Duration>,
    /// How long a caller waits for the shared remote channel
    pub channel_lock_timeout: Duration,
    /// Attempts for transient infrastructure errors before giving up
    pub max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    /// Consecutive polls a job may be absent from the scheduler before it is
    /// declared failed
    pub missing_job_grace_polls: u32,
    /// Payloads above this size are rejected before parsing
    pub max_payload_bytes: usize,
    /// Keep per-job directories after results were collected
    pub keep_job_dirs: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_initial: Duration::from_secs(1),
            poll_interval_max: Duration::from_secs(30),
            poll_backoff_multiplier: 1.5,
            poll_cycle_timeout: Duration::from_secs(60),
            job_timeout: Some(Duration::from_secs(24 * 60 * 60)),
            channel_lock_timeout: Duration::from_secs(30),
            max_attempts: 5,
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            missing_job_grace_polls: 3,
            max_payload_bytes: 16 * 1024 * 1024,
            keep_job_dirs: false,
        }
    }
}

impl ControllerConfig {
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_interval_initial = initial;
        self.poll_interval_max = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.poll_cycle_timeout = timeout;
        self
    }

    pub fn with_channel_lock_timeout(mut self, timeout: Duration) -> Self {
        self.channel_lock_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_delay = initial;
        self.retry_max_delay = max;
        self
    }

    pub fn with_keep_job_dirs(mut self, keep: bool) -> Self {
        self.keep_job_dirs = keep;
        self
    }
}

/// Hard and soft ceilings used when folding tasks into jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub target_cpus_per_job: u32,
    pub max_cpus_per_job: u32,
    pub target_mem_per_job_mb: u64,
    pub max_mem_per_job_mb: u64,
    pub target_num_jobs: usize,
    pub max_num_jobs: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            target_cpus_per_job: 1,
            max_cpus_per_job: 4,
            target_mem_per_job_mb: 4_000,
            max_mem_per_job_mb: 16_000,
            target_num_jobs: 10,
            max_num_jobs: 100,
        }
    }
}

impl BatchLimits {
    pub fn with_cpus(mut self, target: u32, max: u32) -> Self {
        self.target_cpus_per_job = target;
        self.max_cpus_per_job = max;
        self
    }

    pub fn with_mem_mb(mut self, target: u64, max: u64) -> Self {
        self.target_mem_per_job_mb = target;
        self.max_mem_per_job_mb = max;
        self
    }

    pub fn with_num_jobs(mut self, target: usize, max: usize) -> Self {
        self.target_num_jobs = target;
        self.max_num_jobs = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Local,
    ImpersonatedLocal,
    RemoteSecureChannel,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Local => write!(f, "local"),
            ResourceKind::ImpersonatedLocal => write!(f, "impersonated-local"),
            ResourceKind::RemoteSecureChannel => write!(f, "remote-secure-channel"),
        }
    }
}

/// An administrator-defined execution venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub kind: ResourceKind,
    /// Remote host, required for `remote-secure-channel`
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Root under which per-job directories are created
    pub job_root: PathBuf,
    /// Root for per-job task input/output files, defaults to `job_root`
    #[serde(default)]
    pub task_root: Option<PathBuf>,
    /// Worker runtime installs keyed by "major.minor" interpreter version
    #[serde(default)]
    pub worker_locations: BTreeMap<String, PathBuf>,
    /// Key into `worker_locations` used when no exact version matches
    #[serde(default)]
    pub default_worker: Option<String>,
    #[serde(default)]
    pub batching: BatchLimits,
    /// Backend-specific options (Slurm partition, account, binaries, ...)
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Resource {
    pub fn local(name: impl Into<String>, job_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Local,
            host: None,
            port: None,
            job_root: job_root.into(),
            task_root: None,
            worker_locations: BTreeMap::new(),
            default_worker: None,
            batching: BatchLimits::default(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_worker(mut self, version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let version = version.into();
        if self.default_worker.is_none() {
            self.default_worker = Some(version.clone());
        }
        self.worker_locations.insert(version, path.into());
        self
    }

    pub fn with_batching(mut self, batching: BatchLimits) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let resource: Self = toml::from_str(raw)
            .map_err(|e| TaskfoldError::Config(format!("invalid resource definition: {}", e)))?;
        resource.validate()?;
        Ok(resource)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        require_job_root("job_root", &self.job_root)?;
        if let Some(ref root) = self.task_root {
            require_job_root("task_root", root)?;
        }
        if self.worker_locations.is_empty() {
            return Err(TaskfoldError::Config(format!(
                "resource {} declares no worker locations",
                self.name
            )));
        }
        for (version, path) in &self.worker_locations {
            require_absolute(&format!("worker_locations.{}", version), path)?;
        }
        if let Some(ref key) = self.default_worker {
            if !self.worker_locations.contains_key(key) {
                return Err(TaskfoldError::Config(format!(
                    "default_worker {} is not a key of worker_locations",
                    key
                )));
            }
        }
        if self.kind == ResourceKind::RemoteSecureChannel
            && self.host.as_deref().map_or(true, str::is_empty)
        {
            return Err(TaskfoldError::Config(format!(
                "remote resource {} has no host",
                self.name
            )));
        }
        Ok(())
    }

    /// Pick the worker install matching `interpreter` ("major.minor"),
    /// falling back to the default install.
    pub fn worker_for(&self, interpreter: &str) -> Result<&Path> {
        if let Some(path) = self.worker_locations.get(interpreter) {
            return Ok(path);
        }
        let fallback = self
            .default_worker
            .as_ref()
            .and_then(|key| self.worker_locations.get(key))
            .or_else(|| {
                // A single install is unambiguous
                if self.worker_locations.len() == 1 {
                    self.worker_locations.values().next()
                } else {
                    None
                }
            });
        fallback.map(PathBuf::as_path).ok_or_else(|| {
            TaskfoldError::Config(format!(
                "resource {} has no worker for interpreter {}",
                self.name, interpreter
            ))
        })
    }
}

/// A per-actor binding to a [`Resource`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Impersonation target or remote login
    #[serde(default)]
    pub username: Option<String>,
    /// Private key used to open the remote channel
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default)]
    pub job_dir: Option<PathBuf>,
    #[serde(default)]
    pub task_dir: Option<PathBuf>,
    /// Writable cache directory of the impersonated identity
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_path = Some(path.into());
        self
    }

    pub fn with_job_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.job_dir = Some(path.into());
        self
    }

    pub fn with_task_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.task_dir = Some(path.into());
        self
    }

    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| TaskfoldError::Config(format!("invalid profile definition: {}", e)))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }

    /// Check that this profile carries what `resource`'s backend needs.
    pub fn validate_for(&self, resource: &Resource) -> Result<()> {
        for (field, dir) in [
            ("job_dir", &self.job_dir),
            ("task_dir", &self.task_dir),
            ("cache_dir", &self.cache_dir),
        ] {
            if let Some(path) = dir {
                require_job_root(field, path)?;
            }
        }

        let missing = |field: &str| {
            TaskfoldError::Config(format!(
                "profile {} lacks {} required by {} resource {}",
                self.name, field, resource.kind, resource.name
            ))
        };

        match resource.kind {
            ResourceKind::Local => {}
            ResourceKind::ImpersonatedLocal => {
                if self.username.as_deref().map_or(true, str::is_empty) {
                    return Err(missing("username"));
                }
                if self.cache_dir.is_none() {
                    return Err(missing("cache_dir"));
                }
            }
            ResourceKind::RemoteSecureChannel => {
                if self.username.as_deref().map_or(true, str::is_empty) {
                    return Err(missing("username"));
                }
                if self.ssh_key_path.is_none() {
                    return Err(missing("ssh_key_path"));
                }
            }
        }
        Ok(())
    }
}

/// Job directories end up unquoted in `#SBATCH` directives, where Slurm
/// also expands `%` patterns.
fn require_job_root(field: &str, path: &Path) -> Result<()> {
    require_absolute(field, path)?;
    let unsafe_char = match path.to_str() {
        Some(s) => s
            .chars()
            .find(|c| c.is_whitespace() || matches!(*c, '%' | '\'' | '"' | '\\')),
        None => {
            return Err(TaskfoldError::Config(format!(
                "{} is not valid UTF-8: {}",
                field,
                path.display()
            )))
        }
    };
    match unsafe_char {
        Some(c) => Err(TaskfoldError::Config(format!(
            "{} may not contain {:?}, got {}",
            field,
            c,
            path.display()
        ))),
        None => Ok(()),
    }
}

fn require_absolute(field: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(TaskfoldError::Config(format!(
            "{} must be an absolute path, got {}",
            field,
            path.display()
        )))
    }
}
