use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::command::{spawn_capture, CommandOutput, CommandRunner};
use crate::backend::slurm::SlurmBackend;
use crate::config::{ControllerConfig, Profile, Resource, ResourceKind};
use crate::error::{Result, TaskfoldError};

/// Slurm on the controller host, driven as another local user.
pub type ImpersonatedBackend = SlurmBackend<SudoRunner>;

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs every command as `user` through non-interactive `sudo`.
///
/// The child starts from an empty environment; only `PATH` and `LANG` are
/// set, so nothing from the controller's environment crosses the identity
/// boundary.
#[derive(Debug, Clone)]
pub struct SudoRunner {
    user: String,
}

impl SudoRunner {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sudo");
        cmd.env_clear()
            .env("PATH", SAFE_PATH)
            .env("LANG", "C.UTF-8")
            .arg("--non-interactive")
            .arg("--set-home")
            .arg("-u")
            .arg(&self.user)
            .arg("sh")
            .arg("-c")
            .arg(command);
        cmd
    }
}

#[async_trait]
impl CommandRunner for SudoRunner {
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        tracing::debug!(user = %self.user, command = %command, "sudo exec");
        let mut cmd = self.command(command);
        let output = spawn_capture(&mut cmd, stdin).await?;
        // sudo itself exits 1 when it refuses to run without a password
        if output.status == Some(1)
            && output.stderr_str().contains("a password is required")
        {
            return Err(TaskfoldError::Config(format!(
                "sudo refuses to run as {} without a password",
                self.user
            )));
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        format!("sudo -u {}", self.user)
    }
}

impl SlurmBackend<SudoRunner> {
    pub fn impersonated(
        resource: Resource,
        profile: Profile,
        config: ControllerConfig,
    ) -> Result<Self> {
        if resource.kind != ResourceKind::ImpersonatedLocal {
            return Err(TaskfoldError::Config(format!(
                "resource {} is {}, not impersonated-local",
                resource.name, resource.kind
            )));
        }
        profile.validate_for(&resource)?;
        let user = profile.username.clone().unwrap_or_default();
        Self::with_runner(SudoRunner::new(user), resource, profile, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn command_clears_environment() {
        let runner = SudoRunner::new("alice");
        let cmd = runner.command("squeue --noheader");
        let inner = cmd.as_std();

        assert_eq!(inner.get_program(), "sudo");
        let args: Vec<&OsStr> = inner.get_args().collect();
        assert_eq!(
            args,
            [
                "--non-interactive",
                "--set-home",
                "-u",
                "alice",
                "sh",
                "-c",
                "squeue --noheader"
            ]
        );

        let envs: Vec<(&OsStr, Option<&OsStr>)> = inner.get_envs().collect();
        assert_eq!(envs.len(), 2);
        assert!(envs.contains(&(OsStr::new("PATH"), Some(OsStr::new(SAFE_PATH)))));
        assert!(envs.contains(&(OsStr::new("LANG"), Some(OsStr::new("C.UTF-8")))));
        assert_eq!(runner.describe(), "sudo -u alice");
    }

    #[test]
    fn impersonated_requires_matching_kind() {
        let resource = Resource::local("r", "/srv/jobs").with_worker("1.0", "/opt/taskfold");
        let profile = Profile::new("p")
            .with_username("alice")
            .with_cache_dir("/home/alice/.cache");
        assert!(matches!(
            ImpersonatedBackend::impersonated(resource, profile, ControllerConfig::default()),
            Err(TaskfoldError::Config(_))
        ));
    }

    #[test]
    fn impersonated_requires_username() {
        let resource = Resource::local("r", "/srv/jobs")
            .with_kind(ResourceKind::ImpersonatedLocal)
            .with_worker("1.0", "/opt/taskfold");
        let profile = Profile::new("p").with_cache_dir("/home/alice/.cache");
        assert!(ImpersonatedBackend::impersonated(resource, profile, ControllerConfig::default())
            .is_err());
    }
}
