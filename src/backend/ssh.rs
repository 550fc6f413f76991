use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::backend::command::{spawn_capture, CommandOutput, CommandRunner};
use crate::backend::slurm::SlurmBackend;
use crate::config::{ControllerConfig, Profile, Resource, ResourceKind};
use crate::error::{Result, TaskfoldError};

/// Slurm on a remote host reached over SSH.
pub type RemoteBackend = SlurmBackend<SshRunner>;

/// Exit status ssh reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Seconds an idle control master outlives its last client.
const CONTROL_PERSIST_SECS: u64 = 600;

/// A resource handed out to one caller at a time, with a bounded wait.
pub struct SharedChannel<C> {
    inner: Arc<Mutex<C>>,
    lock_timeout: Duration,
}

impl<C> Clone for SharedChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<C> SharedChannel<C> {
    pub fn new(channel: C, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub async fn acquire(&self) -> Result<MutexGuard<'_, C>> {
        self.acquire_within(self.lock_timeout).await
    }

    pub async fn acquire_within(&self, wait: Duration) -> Result<MutexGuard<'_, C>> {
        match tokio::time::timeout(wait, self.inner.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(waited = ?wait, "Shared channel still busy");
                Err(TaskfoldError::ChannelBusy(wait))
            }
        }
    }
}

/// One `ssh -M` control master. Every command travels through its socket.
#[derive(Debug)]
pub struct SshConnection {
    program: PathBuf,
    host: String,
    port: Option<u16>,
    user: String,
    key: PathBuf,
    control_path: PathBuf,
    connected: bool,
}

impl SshConnection {
    pub fn new(
        host: impl Into<String>,
        port: Option<u16>,
        user: impl Into<String>,
        key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: PathBuf::from("ssh"),
            host: host.into(),
            port,
            user: user.into(),
            key: key.into(),
            control_path: std::env::temp_dir()
                .join(format!("taskfold-{}.sock", Uuid::new_v4().simple())),
            connected: false,
        }
    }

    /// Use another `ssh` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("IdentitiesOnly=yes")
            .arg("-i")
            .arg(&self.key);
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd
    }

    /// The `ssh` invocation that runs `command` through the control socket.
    /// It never opens a connection of its own.
    pub fn exec_command(&self, command: &str) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-o")
            .arg("ControlMaster=no")
            .arg(self.destination())
            .arg("--")
            .arg(format!("sh -c {}", crate::backend::command::shell_quote(command)));
        cmd
    }

    pub async fn connect(&mut self) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("-M")
            .arg("-o")
            .arg(format!("ControlPersist={}", CONTROL_PERSIST_SECS))
            .arg("-f")
            .arg("-N")
            .arg(self.destination());
        let output = spawn_capture(&mut cmd, None).await?;
        if !output.success() {
            self.connected = false;
            return Err(TaskfoldError::Channel(format!(
                "cannot connect to {}: {}",
                self.destination(),
                output.stderr_str()
            )));
        }
        tracing::info!(destination = %self.destination(), "SSH control master established");
        self.connected = true;
        Ok(())
    }

    /// Ask the control master whether it is still alive.
    pub async fn check(&mut self) -> bool {
        let mut cmd = self.base_command();
        cmd.arg("-O").arg("check").arg(self.destination());
        self.connected = matches!(spawn_capture(&mut cmd, None).await, Ok(out) if out.success());
        self.connected
    }

    /// Make sure a live master is there before anything is sent.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.connected && self.check().await {
            return Ok(());
        }
        self.connect().await
    }

    /// Run `command` once through the master.
    ///
    /// Status 255 is ambiguous: ssh uses it for its own failures but a
    /// remote program may exit with it too. It only counts as a transport
    /// failure when the master is gone afterwards, and then the command may
    /// or may not have run.
    pub async fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        tracing::debug!(destination = %self.destination(), command = %command, "ssh exec");
        let mut cmd = self.exec_command(command);
        let output = spawn_capture(&mut cmd, stdin).await?;
        let suspect = output.status == Some(SSH_TRANSPORT_FAILURE) || output.status.is_none();
        if suspect && !self.check().await {
            return Err(TaskfoldError::Channel(format!(
                "ssh to {} dropped: {}",
                self.destination(),
                output.stderr_str()
            )));
        }
        Ok(output)
    }

    pub fn exit_command(&self) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-O").arg("exit").arg(self.destination());
        cmd
    }

    /// Stop the control master and remove its socket.
    pub async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let mut cmd = self.exit_command();
        match spawn_capture(&mut cmd, None).await {
            Ok(out) if out.success() => {
                tracing::info!(destination = %self.destination(), "SSH control master closed")
            }
            Ok(out) => tracing::warn!(
                destination = %self.destination(),
                stderr = %out.stderr_str(),
                "Control master did not exit cleanly"
            ),
            Err(e) => {
                tracing::warn!(destination = %self.destination(), error = %e, "Failed to close control master")
            }
        }
        self.connected = false;
    }
}

/// [`CommandRunner`] over a shared SSH connection.
///
/// A dead master is replaced before a command is sent. A connection that
/// drops while a command is in flight is replayed once for [`run`], and
/// reported as a non-transient [`TaskfoldError::Scheduler`] for
/// [`run_once`], since the remote side may already have acted on it.
///
/// [`run`]: CommandRunner::run
/// [`run_once`]: CommandRunner::run_once
#[derive(Clone)]
pub struct SshRunner {
    channel: SharedChannel<SshConnection>,
    destination: String,
}

impl SshRunner {
    pub fn new(connection: SshConnection, lock_timeout: Duration) -> Self {
        let destination = connection.destination();
        Self {
            channel: SharedChannel::new(connection, lock_timeout),
            destination,
        }
    }

    pub fn channel(&self) -> &SharedChannel<SshConnection> {
        &self.channel
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.channel.acquire().await?.disconnect().await;
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut connection = self.channel.acquire().await?;
        connection.ensure_connected().await?;
        match connection.exec(command, stdin).await {
            Err(TaskfoldError::Channel(reason)) => {
                tracing::warn!(destination = %self.destination, reason = %reason, "Reconnecting");
                connection.connect().await?;
                connection.exec(command, stdin).await
            }
            other => other,
        }
    }

    async fn run_once(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut connection = self.channel.acquire().await?;
        connection.ensure_connected().await?;
        match connection.exec(command, stdin).await {
            Err(TaskfoldError::Channel(reason)) => {
                tracing::error!(
                    destination = %self.destination,
                    command = %command,
                    reason = %reason,
                    "Connection dropped with a command in flight"
                );
                Err(TaskfoldError::Scheduler(format!(
                    "`{}` on {} may or may not have run: {}",
                    command, self.destination, reason
                )))
            }
            other => other,
        }
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }

    fn describe(&self) -> String {
        self.destination.clone()
    }
}

impl SlurmBackend<SshRunner> {
    pub fn remote(resource: Resource, profile: Profile, config: ControllerConfig) -> Result<Self> {
        if resource.kind != ResourceKind::RemoteSecureChannel {
            return Err(TaskfoldError::Config(format!(
                "resource {} is {}, not remote-secure-channel",
                resource.name, resource.kind
            )));
        }
        resource.validate()?;
        profile.validate_for(&resource)?;
        let connection = SshConnection::new(
            resource.host.clone().unwrap_or_default(),
            resource.port,
            profile.username.clone().unwrap_or_default(),
            profile.ssh_key_path.clone().unwrap_or_default(),
        );
        let runner = SshRunner::new(connection, config.channel_lock_timeout);
        Self::with_runner(runner, resource, profile, config)
    }
}
