use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Plain-data summary of a worker-side failure.
///
/// Built by the worker when a task fails and shipped back in place of a
/// result. The controller never rebuilds the worker's own error type from
/// it; see [`ExceptionProxy::into_error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionProxy {
    pub exc_type_name: String,
    #[serde(default)]
    pub traceback: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ExceptionProxy {
    pub fn new(exc_type_name: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            exc_type_name: exc_type_name.into(),
            traceback: traceback.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn into_error(self) -> TaskExecutionError {
        TaskExecutionError {
            exc_type_name: self.exc_type_name,
            traceback: self.traceback,
            args: self.args,
            kwargs: self.kwargs,
        }
    }
}

/// The one error type synthesized for every worker-side failure.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Task failed with {exc_type_name}: {}", summary(.traceback))]
pub struct TaskExecutionError {
    pub exc_type_name: String,
    pub traceback: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

// Last non-empty traceback line, which usually names the failure
fn summary(traceback: &str) -> &str {
    traceback
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("<no traceback>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_error_keeps_all_fields() {
        let proxy = ExceptionProxy::new("NonZeroExit", "step 1\nboom\n")
            .with_arg(3)
            .with_kwarg("program", "/bin/false");
        let err = proxy.clone().into_error();
        assert_eq!(err.exc_type_name, "NonZeroExit");
        assert_eq!(err.traceback, proxy.traceback);
        assert_eq!(err.args, vec![Value::from(3)]);
        assert_eq!(err.kwargs.get("program"), Some(&Value::from("/bin/false")));
    }

    #[test]
    fn display_uses_last_traceback_line() {
        let err = ExceptionProxy::new("ValueError", "Traceback:\n  frame\nValueError: bad\n\n")
            .into_error();
        assert_eq!(err.to_string(), "Task failed with ValueError: ValueError: bad");

        let err = ExceptionProxy::new("Interrupted", "").into_error();
        assert_eq!(err.to_string(), "Task failed with Interrupted: <no traceback>");
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let proxy: ExceptionProxy =
            serde_json::from_value(serde_json::json!({"exc_type_name": "SpawnError"})).unwrap();
        assert!(proxy.traceback.is_empty());
        assert!(proxy.args.is_empty());
        assert!(proxy.kwargs.is_empty());
    }
}
