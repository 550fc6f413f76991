use serde::{Deserialize, Serialize};

use crate::channel::payload::{self, Payload, VERSION_TYPES};
use crate::error::{Result, TaskfoldError};

/// Version of this build of taskfold.
pub const CONTROLLER_SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compiler version the worker runtime was built with.
const INTERPRETER_VERSION: &str = env!("TASKFOLD_RUSTC_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReport {
    pub interpreter: [u32; 3],
    pub controller_software: String,
}

impl VersionReport {
    pub fn new(interpreter: [u32; 3], controller_software: impl Into<String>) -> Self {
        Self {
            interpreter,
            controller_software: controller_software.into(),
        }
    }

    /// Report describing the running binary.
    pub fn current() -> Self {
        Self {
            interpreter: parse_triple(INTERPRETER_VERSION),
            controller_software: CONTROLLER_SOFTWARE_VERSION.to_string(),
        }
    }

    /// "major.minor" key used to select a worker install.
    pub fn interpreter_key(&self) -> String {
        format!("{}.{}", self.interpreter[0], self.interpreter[1])
    }

    pub fn interpreter_string(&self) -> String {
        let [major, minor, patch] = self.interpreter;
        format!("{}.{}.{}", major, minor, patch)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        payload::encode(&Payload::Version(self.clone()))
    }

    pub fn decode(bytes: &[u8], max_bytes: usize) -> Result<Self> {
        match payload::decode(VERSION_TYPES, bytes, max_bytes)? {
            Payload::Version(report) => Ok(report),
            other => Err(TaskfoldError::MalformedPayload(format!(
                "expected a version report, got {:?}",
                other
            ))),
        }
    }
}

fn parse_triple(raw: &str) -> [u32; 3] {
    let mut parts = raw
        .trim()
        .split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    [
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    ]
}

/// Outcome of an accepted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCheck {
    pub interpreter_matches: bool,
}

#[derive(Debug, Clone)]
pub struct VersionGuard {
    local: VersionReport,
    /// Treat interpreter differences as fatal too
    strict_interpreter: bool,
}

impl Default for VersionGuard {
    fn default() -> Self {
        Self::new(VersionReport::current())
    }
}

impl VersionGuard {
    pub fn new(local: VersionReport) -> Self {
        Self {
            local,
            strict_interpreter: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict_interpreter = true;
        self
    }

    pub fn local(&self) -> &VersionReport {
        &self.local
    }

    pub fn check(&self, remote: &VersionReport) -> Result<VersionCheck> {
        check(&self.local, remote).and_then(|outcome| {
            if self.strict_interpreter && !outcome.interpreter_matches {
                Err(TaskfoldError::VersionMismatch {
                    local: format!(
                        "{} (interpreter {})",
                        self.local.controller_software,
                        self.local.interpreter_string()
                    ),
                    remote: format!(
                        "{} (interpreter {})",
                        remote.controller_software,
                        remote.interpreter_string()
                    ),
                })
            } else {
                Ok(outcome)
            }
        })
    }
}

/// Compare the controller's versions with a worker's report.
///
/// A controller-software difference is fatal; an interpreter difference is
/// only logged.
pub fn check(local: &VersionReport, remote: &VersionReport) -> Result<VersionCheck> {
    if local.controller_software != remote.controller_software {
        tracing::error!(
            local = %local.controller_software,
            remote = %remote.controller_software,
            "Worker runs a different taskfold version"
        );
        return Err(TaskfoldError::VersionMismatch {
            local: local.controller_software.clone(),
            remote: remote.controller_software.clone(),
        });
    }

    let interpreter_matches = local.interpreter == remote.interpreter;
    if !interpreter_matches {
        tracing::warn!(
            local = %local.interpreter_string(),
            remote = %remote.interpreter_string(),
            "Worker interpreter version differs from controller"
        );
    }
    Ok(VersionCheck {
        interpreter_matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_versions_pass() {
        let local = VersionReport::new([1, 82, 0], "0.1.0");
        let outcome = check(&local, &local.clone()).unwrap();
        assert!(outcome.interpreter_matches);
    }

    #[test]
    fn software_mismatch_is_fatal_and_names_both() {
        let local = VersionReport::new([1, 82, 0], "0.1.0");
        let remote = VersionReport::new([1, 82, 0], "0.2.3");
        let err = check(&local, &remote).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, TaskfoldError::VersionMismatch { .. }));
        assert!(msg.contains("0.1.0"), "{}", msg);
        assert!(msg.contains("0.2.3"), "{}", msg);
    }

    #[test]
    fn interpreter_mismatch_is_a_warning() {
        let local = VersionReport::new([1, 82, 0], "0.1.0");
        let remote = VersionReport::new([1, 79, 0], "0.1.0");
        let outcome = check(&local, &remote).unwrap();
        assert!(!outcome.interpreter_matches);
    }

    #[test]
    fn strict_guard_rejects_interpreter_mismatch() {
        let guard = VersionGuard::new(VersionReport::new([1, 82, 0], "0.1.0")).strict();
        let remote = VersionReport::new([1, 79, 0], "0.1.0");
        assert!(guard.check(&remote).is_err());
    }

    #[test]
    fn report_wire_format() {
        let report = VersionReport::new([1, 82, 1], "0.1.0");
        let value: serde_json::Value = serde_json::from_slice(&report.encode().unwrap()).unwrap();
        assert_eq!(value["ns"], "taskfold");
        assert_eq!(value["type"], "VersionReport");
        assert_eq!(
            value["value"],
            serde_json::json!({"interpreter": [1, 82, 1], "controller_software": "0.1.0"})
        );
        assert_eq!(VersionReport::decode(&report.encode().unwrap(), 1024).unwrap(), report);
    }

    #[test]
    fn current_report_keys() {
        let report = VersionReport::current();
        assert_eq!(report.controller_software, CONTROLLER_SOFTWARE_VERSION);
        assert_eq!(
            report.interpreter_key(),
            format!("{}.{}", report.interpreter[0], report.interpreter[1])
        );
        assert_eq!(parse_triple("1.82.0"), [1, 82, 0]);
        assert_eq!(parse_triple("garbage"), [0, 0, 0]);
    }
}
