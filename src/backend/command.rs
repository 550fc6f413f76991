use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, TaskfoldError};

/// Exit status used by [`read_file`] to signal a missing file.
const MISSING_FILE_STATUS: i32 = 44;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs shell commands on an execution venue, across whatever boundary
/// separates it from the controller.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;

    /// Run a command that must not execute twice, such as a submission.
    /// A runner that replays commands after a transport failure must not
    /// replay this one.
    async fn run_once(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        self.run(command, stdin).await
    }

    /// Release whatever the runner holds open on the venue.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Short human-readable description used in logs
    fn describe(&self) -> String;
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

/// Spawn `cmd`, feed it `stdin`, and collect its output.
pub(crate) async fn spawn_capture(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
) -> std::io::Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // Write concurrently with reading so large inputs cannot deadlock
        let data = data.to_vec();
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&data).await {
                tracing::debug!(error = %e, "Child closed stdin early");
            }
        });
    }
    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        status: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Run `command`, turning a non-zero exit into [`TaskfoldError::Scheduler`].
pub async fn run_checked(
    runner: &dyn CommandRunner,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput> {
    let output = runner.run(command, stdin).await?;
    checked(runner, command, output)
}

/// [`run_checked`] for commands that are not idempotent.
pub async fn run_checked_once(
    runner: &dyn CommandRunner,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput> {
    let output = runner.run_once(command, stdin).await?;
    checked(runner, command, output)
}

fn checked(
    runner: &dyn CommandRunner,
    command: &str,
    output: CommandOutput,
) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(TaskfoldError::Scheduler(format!(
            "`{}` on {} exited with {:?}: {}",
            command,
            runner.describe(),
            output.status,
            output.stderr_str()
        )))
    }
}

pub async fn make_dirs(runner: &dyn CommandRunner, dirs: &[&Path]) -> Result<()> {
    let quoted: Vec<String> = dirs.iter().map(|d| quote_path(d)).collect();
    run_checked(runner, &format!("mkdir -p {}", quoted.join(" ")), None).await?;
    Ok(())
}

pub async fn write_file(runner: &dyn CommandRunner, path: &Path, contents: &[u8]) -> Result<()> {
    run_checked(runner, &format!("cat > {}", quote_path(path)), Some(contents)).await?;
    Ok(())
}

/// Read a file on the venue; `None` if it does not exist.
pub async fn read_file(runner: &dyn CommandRunner, path: &Path) -> Result<Option<Vec<u8>>> {
    let quoted = quote_path(path);
    let command = format!(
        "if [ -f {q} ]; then cat {q}; else exit {code}; fi",
        q = quoted,
        code = MISSING_FILE_STATUS
    );
    let output = runner.run(&command, None).await?;
    match output.status {
        Some(0) => Ok(Some(output.stdout)),
        Some(MISSING_FILE_STATUS) => Ok(None),
        status => Err(TaskfoldError::Scheduler(format!(
            "reading {} on {} exited with {:?}: {}",
            path.display(),
            runner.describe(),
            status,
            output.stderr_str()
        ))),
    }
}

pub async fn remove_dirs(runner: &dyn CommandRunner, dirs: &[&Path]) -> Result<()> {
    let quoted: Vec<String> = dirs.iter().map(|d| quote_path(d)).collect();
    run_checked(runner, &format!("rm -rf {}", quoted.join(" ")), None).await?;
    Ok(())
}
