use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::channel::exception::ExceptionProxy;
use crate::error::{Result, TaskfoldError};
use crate::scheduler::job::EntryPoint;
use crate::version::VersionReport;

pub const NS_BUILTINS: &str = "builtins";
pub const NS_TASKFOLD: &str = "taskfold";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ns: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub value: Value,
}

impl Envelope {
    fn new(ns: &str, type_name: &str, value: Value) -> Self {
        Self {
            ns: ns.to_string(),
            type_name: type_name.to_string(),
            value,
        }
    }
}

/// Values a task may take as input or hand back as its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskValue {
    None,
    Json(Value),
    Text(String),
    Path(PathBuf),
}

impl TaskValue {
    /// JSON form handed to an entry point on stdin.
    pub fn to_json(&self) -> Value {
        // Decoded paths are always UTF-8, so display() is lossless here
        match self {
            TaskValue::None => Value::Null,
            TaskValue::Json(v) => v.clone(),
            TaskValue::Text(s) => Value::String(s.clone()),
            TaskValue::Path(p) => Value::String(p.display().to_string()),
        }
    }

    /// Paths travel as JSON strings, so a path that is not valid UTF-8 is
    /// refused rather than silently rewritten.
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(match self {
            TaskValue::None => Envelope::new(NS_BUILTINS, "none", Value::Null),
            TaskValue::Json(v) => Envelope::new(NS_BUILTINS, "json", v.clone()),
            TaskValue::Text(s) => Envelope::new(NS_BUILTINS, "str", Value::String(s.clone())),
            TaskValue::Path(p) => {
                let s = p.to_str().ok_or_else(|| {
                    TaskfoldError::MalformedPayload(format!(
                        "path {} is not valid UTF-8",
                        p.display()
                    ))
                })?;
                Envelope::new(NS_BUILTINS, "path", Value::String(s.to_string()))
            }
        })
    }
}

/// Worker-side view of one task, as written to its input file.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInput {
    pub task_id: Uuid,
    pub label: String,
    pub entry_point: EntryPoint,
    pub payload: TaskValue,
}

#[derive(Serialize, Deserialize)]
struct RawTaskInput {
    task_id: Uuid,
    label: String,
    entry_point: EntryPoint,
    payload: Envelope,
}

impl TaskInput {
    pub fn envelope(&self) -> Result<Envelope> {
        let raw = RawTaskInput {
            task_id: self.task_id,
            label: self.label.clone(),
            entry_point: self.entry_point.clone(),
            payload: self.payload.envelope()?,
        };
        Ok(Envelope::new(
            NS_TASKFOLD,
            "TaskInput",
            serde_json::to_value(raw)?,
        ))
    }
}

/// Everything the registries can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Value(TaskValue),
    Exception(ExceptionProxy),
    Input(TaskInput),
    Version(VersionReport),
}

impl Payload {
    pub fn envelope(&self) -> Result<Envelope> {
        match self {
            Payload::Value(v) => v.envelope(),
            Payload::Exception(proxy) => Ok(Envelope::new(
                NS_TASKFOLD,
                "ExceptionProxy",
                serde_json::to_value(proxy)?,
            )),
            Payload::Input(input) => input.envelope(),
            Payload::Version(report) => Ok(Envelope::new(
                NS_TASKFOLD,
                "VersionReport",
                serde_json::to_value(report)?,
            )),
        }
    }
}

type Decoder = fn(Value) -> Result<Payload>;

pub struct RegistryEntry {
    pub ns: &'static str,
    pub type_name: &'static str,
    decode: Decoder,
}

const fn entry(ns: &'static str, type_name: &'static str, decode: Decoder) -> RegistryEntry {
    RegistryEntry {
        ns,
        type_name,
        decode,
    }
}

/// Plain values, accepted inside task inputs.
pub const VALUE_TYPES: &[RegistryEntry] = &[
    entry(NS_BUILTINS, "none", decode_none),
    entry(NS_BUILTINS, "json", decode_json),
    entry(NS_BUILTINS, "str", decode_str),
    entry(NS_BUILTINS, "path", decode_path),
];

/// What a worker may write to a task output file.
pub const OUTPUT_TYPES: &[RegistryEntry] = &[
    entry(NS_BUILTINS, "none", decode_none),
    entry(NS_BUILTINS, "json", decode_json),
    entry(NS_BUILTINS, "str", decode_str),
    entry(NS_BUILTINS, "path", decode_path),
    entry(NS_TASKFOLD, "ExceptionProxy", decode_exception),
];

pub const INPUT_TYPES: &[RegistryEntry] = &[entry(NS_TASKFOLD, "TaskInput", decode_input)];

pub const VERSION_TYPES: &[RegistryEntry] =
    &[entry(NS_TASKFOLD, "VersionReport", decode_version)];

pub fn encode(payload: &Payload) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&payload.envelope()?)?)
}

/// Parse `bytes` as an envelope and decode it against `registry`.
pub fn decode(registry: &[RegistryEntry], bytes: &[u8], max_bytes: usize) -> Result<Payload> {
    if bytes.len() > max_bytes {
        return Err(TaskfoldError::MalformedPayload(format!(
            "payload of {} bytes exceeds limit of {} bytes",
            bytes.len(),
            max_bytes
        )));
    }
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| TaskfoldError::MalformedPayload(format!("not a payload envelope: {}", e)))?;
    decode_envelope(registry, envelope)
}

pub fn decode_envelope(registry: &[RegistryEntry], envelope: Envelope) -> Result<Payload> {
    let found = registry
        .iter()
        .find(|e| e.ns == envelope.ns && e.type_name == envelope.type_name);
    match found {
        Some(entry) => (entry.decode)(envelope.value),
        None => {
            tracing::warn!(
                ns = %envelope.ns,
                type_name = %envelope.type_name,
                "Rejected payload with type outside the allow-list"
            );
            Err(TaskfoldError::ForbiddenPayloadType {
                namespace: envelope.ns,
                type_name: envelope.type_name,
            })
        }
    }
}

fn malformed(type_name: &str, detail: impl std::fmt::Display) -> TaskfoldError {
    TaskfoldError::MalformedPayload(format!("invalid {} value: {}", type_name, detail))
}

fn decode_none(value: Value) -> Result<Payload> {
    if value.is_null() {
        Ok(Payload::Value(TaskValue::None))
    } else {
        Err(malformed("none", "expected null"))
    }
}

fn decode_json(value: Value) -> Result<Payload> {
    Ok(Payload::Value(TaskValue::Json(value)))
}

fn decode_str(value: Value) -> Result<Payload> {
    match value {
        Value::String(s) => Ok(Payload::Value(TaskValue::Text(s))),
        other => Err(malformed("str", format!("expected string, got {}", other))),
    }
}

fn decode_path(value: Value) -> Result<Payload> {
    match value {
        Value::String(s) => Ok(Payload::Value(TaskValue::Path(PathBuf::from(s)))),
        other => Err(malformed("path", format!("expected string, got {}", other))),
    }
}

fn decode_exception(value: Value) -> Result<Payload> {
    let proxy: ExceptionProxy =
        serde_json::from_value(value).map_err(|e| malformed("ExceptionProxy", e))?;
    Ok(Payload::Exception(proxy))
}

fn decode_input(value: Value) -> Result<Payload> {
    let raw: RawTaskInput = serde_json::from_value(value).map_err(|e| malformed("TaskInput", e))?;
    let payload = match decode_envelope(VALUE_TYPES, raw.payload)? {
        Payload::Value(v) => v,
        _ => return Err(malformed("TaskInput", "payload is not a plain value")),
    };
    Ok(Payload::Input(TaskInput {
        task_id: raw.task_id,
        label: raw.label,
        entry_point: raw.entry_point,
        payload,
    }))
}

fn decode_version(value: Value) -> Result<Payload> {
    let report: VersionReport =
        serde_json::from_value(value).map_err(|e| malformed("VersionReport", e))?;
    Ok(Payload::Version(report))
}
