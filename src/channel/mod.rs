//! Task input/output transport between controller and workers.

pub mod exception;
pub mod payload;

pub use exception::{ExceptionProxy, TaskExecutionError};
pub use payload::{TaskInput, TaskValue};

use crate::error::{Result, TaskfoldError};
use crate::scheduler::job::TaskSpec;
use payload::{Payload, INPUT_TYPES, OUTPUT_TYPES};

/// What a task output file decodes to.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Value(TaskValue),
    Exception(ExceptionProxy),
}

impl TaskOutput {
    /// Turn a decoded output into the task's outcome, synthesizing the
    /// generic execution error for worker-side failures.
    pub fn into_result(self) -> std::result::Result<TaskValue, TaskExecutionError> {
        match self {
            TaskOutput::Value(v) => Ok(v),
            TaskOutput::Exception(proxy) => Err(proxy.into_error()),
        }
    }
}

pub fn encode_task_input(spec: &TaskSpec) -> Result<Vec<u8>> {
    payload::encode(&Payload::Input(TaskInput {
        task_id: spec.id,
        label: spec.label.clone(),
        entry_point: spec.entry_point.clone(),
        payload: spec.payload.clone(),
    }))
}

pub fn decode_task_input(bytes: &[u8], max_bytes: usize) -> Result<TaskInput> {
    match payload::decode(INPUT_TYPES, bytes, max_bytes)? {
        Payload::Input(input) => Ok(input),
        other => Err(unexpected("task input", &other)),
    }
}

pub fn encode_task_output(output: &TaskOutput) -> Result<Vec<u8>> {
    let payload = match output {
        TaskOutput::Value(v) => Payload::Value(v.clone()),
        TaskOutput::Exception(proxy) => Payload::Exception(proxy.clone()),
    };
    payload::encode(&payload)
}

pub fn decode_task_output(bytes: &[u8], max_bytes: usize) -> Result<TaskOutput> {
    match payload::decode(OUTPUT_TYPES, bytes, max_bytes)? {
        Payload::Value(v) => Ok(TaskOutput::Value(v)),
        Payload::Exception(proxy) => Ok(TaskOutput::Exception(proxy)),
        other => Err(unexpected("task output", &other)),
    }
}

fn unexpected(context: &str, payload: &Payload) -> TaskfoldError {
    TaskfoldError::MalformedPayload(format!("unexpected payload in {}: {:?}", context, payload))
}
