use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, ExceptionProxy, TaskInput, TaskOutput, TaskValue};
use crate::error::Result;
use crate::version::VersionReport;

/// Runs one task's entry point and turns its outcome into a [`TaskOutput`].
///
/// The payload's JSON form is written to the program's stdin. On exit 0
/// stdout becomes the task value: parsed as JSON when possible, raw text
/// otherwise, and `None` when empty. Any failure becomes an
/// [`ExceptionProxy`] rather than an error of the worker itself.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    max_payload_bytes: usize,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl TaskExecutor {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub async fn execute(&self, input: &TaskInput, cancel: &CancellationToken) -> TaskOutput {
        let program = &input.entry_point.program;
        tracing::info!(
            task_id = %input.task_id,
            label = %input.label,
            program = %program,
            "Executing task"
        );

        let mut cmd = Command::new(program);
        cmd.args(&input.entry_point.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id = %input.task_id, error = %e, "Failed to spawn task");
                return TaskOutput::Exception(
                    ExceptionProxy::new("SpawnError", e.to_string())
                        .with_arg(e.to_string())
                        .with_kwarg("program", program.as_str()),
                );
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.payload.to_json().to_string().into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(error = %e, "Task closed stdin early");
                }
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancel.cancelled() => {
                tracing::warn!(task_id = %input.task_id, "Task interrupted");
                return TaskOutput::Exception(
                    ExceptionProxy::new("Interrupted", "worker received a termination signal")
                        .with_kwarg("program", program.as_str()),
                );
            }
        };

        Self::process_output(input, output)
    }

    fn process_output(
        input: &TaskInput,
        result: std::io::Result<std::process::Output>,
    ) -> TaskOutput {
        let program = input.entry_point.program.as_str();
        match result {
            Ok(output) => {
                let exit_code = output.status.code();
                tracing::info!(
                    task_id = %input.task_id,
                    exit_code = ?exit_code,
                    "Task completed"
                );
                if output.status.success() {
                    TaskOutput::Value(parse_stdout(&output.stdout))
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    let traceback = if stderr.trim().is_empty() {
                        format!("{} exited with {:?}", program, exit_code)
                    } else {
                        stderr
                    };
                    TaskOutput::Exception(
                        ExceptionProxy::new("NonZeroExit", traceback)
                            .with_arg(exit_code.map_or(serde_json::Value::Null, Into::into))
                            .with_kwarg("program", program),
                    )
                }
            }
            Err(e) => {
                tracing::error!(task_id = %input.task_id, error = %e, "Task execution failed");
                TaskOutput::Exception(
                    ExceptionProxy::new("SpawnError", e.to_string())
                        .with_arg(e.to_string())
                        .with_kwarg("program", program),
                )
            }
        }
    }

    /// Read `input_file`, run the task and write its output file.
    ///
    /// Returns whether the task succeeded. An input file the restricted
    /// decoder refuses still yields an output file, holding an
    /// `InvalidTaskInput` proxy.
    pub async fn run_files(
        &self,
        input_file: &Path,
        output_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let bytes = tokio::fs::read(input_file).await?;
        let output = match channel::decode_task_input(&bytes, self.max_payload_bytes) {
            Ok(input) => self.execute(&input, cancel).await,
            Err(e) => {
                tracing::error!(input = %input_file.display(), error = %e, "Refusing task input");
                TaskOutput::Exception(
                    ExceptionProxy::new("InvalidTaskInput", e.to_string())
                        .with_arg(input_file.display().to_string()),
                )
            }
        };
        let mut ok = matches!(output, TaskOutput::Value(_));
        let mut bytes = channel::encode_task_output(&output)?;
        if bytes.len() > self.max_payload_bytes {
            tracing::error!(
                output = %output_file.display(),
                bytes = bytes.len(),
                limit = self.max_payload_bytes,
                "Task output exceeds payload limit"
            );
            let proxy = Self::oversized(bytes.len(), self.max_payload_bytes);
            bytes = channel::encode_task_output(&proxy)?;
            ok = false;
        }
        write_atomically(output_file, &bytes).await?;
        Ok(ok)
    }

    fn oversized(size: usize, limit: usize) -> TaskOutput {
        TaskOutput::Exception(
            ExceptionProxy::new(
                "OutputTooLarge",
                format!("encoded output of {} bytes exceeds limit of {} bytes", size, limit),
            )
            .with_arg(size)
            .with_arg(limit),
        )
    }
}

fn parse_stdout(stdout: &[u8]) -> TaskValue {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return TaskValue::None;
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => TaskValue::Json(value),
        Err(_) => TaskValue::Text(text.into_owned()),
    }
}

/// Write the worker's version report, to `path` or to stdout.
pub async fn write_version_report(path: Option<&Path>) -> Result<()> {
    let bytes = VersionReport::current().encode()?;
    match path {
        Some(path) => write_atomically(path, &bytes).await,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}

/// Readers never observe a partially written file.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::EntryPoint;
    use uuid::Uuid;

    fn input(program: &str, args: &[&str], payload: TaskValue) -> TaskInput {
        let mut entry_point = EntryPoint::new(program);
        for arg in args {
            entry_point = entry_point.with_arg(*arg);
        }
        TaskInput {
            task_id: Uuid::new_v4(),
            label: "task-0".into(),
            entry_point,
            payload,
        }
    }

    #[test]
    fn stdout_parsing() {
        assert_eq!(parse_stdout(b""), TaskValue::None);
        assert_eq!(parse_stdout(b"  \n"), TaskValue::None);
        assert_eq!(parse_stdout(b"[1, 2]\n"), TaskValue::Json(serde_json::json!([1, 2])));
        assert_eq!(parse_stdout(b"hello\n"), TaskValue::Text("hello\n".into()));
    }

    #[tokio::test]
    async fn payload_reaches_stdin() {
        let exec = TaskExecutor::default();
        let input = input("cat", &[], TaskValue::Json(serde_json::json!({"n": 3})));
        let output = exec.execute(&input, &CancellationToken::new()).await;
        assert_eq!(
            output,
            TaskOutput::Value(TaskValue::Json(serde_json::json!({"n": 3})))
        );
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_proxy() {
        let exec = TaskExecutor::default();
        let input = input("sh", &["-c", "echo boom >&2; exit 7"], TaskValue::None);
        match exec.execute(&input, &CancellationToken::new()).await {
            TaskOutput::Exception(proxy) => {
                assert_eq!(proxy.exc_type_name, "NonZeroExit");
                assert_eq!(proxy.args, vec![serde_json::json!(7)]);
                assert_eq!(proxy.kwargs["program"], "sh");
                assert!(proxy.traceback.contains("boom"));
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_program_becomes_spawn_error() {
        let exec = TaskExecutor::default();
        let input = input("/nonexistent/taskfold-test", &[], TaskValue::None);
        match exec.execute(&input, &CancellationToken::new()).await {
            TaskOutput::Exception(proxy) => assert_eq!(proxy.exc_type_name, "SpawnError"),
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_task() {
        let exec = TaskExecutor::default();
        let input = input("sleep", &["30"], TaskValue::None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        match exec.execute(&input, &cancel).await {
            TaskOutput::Exception(proxy) => assert_eq!(proxy.exc_type_name, "Interrupted"),
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn forbidden_input_still_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input_file = dir.path().join("task-0.in.json");
        let output_file = dir.path().join("task-0.out.json");
        tokio::fs::write(&input_file, br#"{"ns":"os","type":"system","value":"id"}"#)
            .await
            .unwrap();

        let ok = TaskExecutor::default()
            .run_files(&input_file, &output_file, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!ok);

        let bytes = tokio::fs::read(&output_file).await.unwrap();
        match channel::decode_task_output(&bytes, 1 << 20).unwrap() {
            TaskOutput::Exception(proxy) => assert_eq!(proxy.exc_type_name, "InvalidTaskInput"),
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_output_is_replaced_by_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let input_file = dir.path().join("task-0.in.json");
        let output_file = dir.path().join("task-0.out.json");
        let spec = crate::scheduler::job::TaskSpec::new(
            EntryPoint::new("sh")
                .with_arg("-c")
                .with_arg("head -c 5000 /dev/zero | tr '\\0' x"),
            TaskValue::None,
        );
        tokio::fs::write(&input_file, channel::encode_task_input(&spec).unwrap())
            .await
            .unwrap();

        let ok = TaskExecutor::new(1024)
            .run_files(&input_file, &output_file, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!ok);

        let bytes = tokio::fs::read(&output_file).await.unwrap();
        assert!(bytes.len() <= 1024);
        match channel::decode_task_output(&bytes, 1024).unwrap() {
            TaskOutput::Exception(proxy) => {
                assert_eq!(proxy.exc_type_name, "OutputTooLarge");
                assert_eq!(proxy.args[1], serde_json::json!(1024));
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }
}
