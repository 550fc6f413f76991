use crate::scheduler::job::JobState;

/// Native tokens after which the job never runs again.
pub const TERMINAL_TOKENS: &[&str] = &[
    "boot-failure",
    "cancelled",
    "completed",
    "deadline-exceeded",
    "failed",
    "node-failure",
    "out-of-memory",
    "preempted",
    "special-exit",
    "timeout",
];

fn normalize(native: &str) -> String {
    let first = native.split_whitespace().next().unwrap_or("");
    first
        .trim_end_matches('+')
        .to_ascii_uppercase()
        .replace('-', "_")
}

/// Accepts Slurm spellings (`NODE_FAIL`) and kebab-case (`node-failure`).
/// Decorations like `CANCELLED by 1000` or `COMPLETED+` are stripped.
pub fn classify(native_state: &str) -> JobState {
    let token = normalize(native_state);
    match token.as_str() {
        "COMPLETED" => JobState::FinishedOk,

        "BOOT_FAIL" | "BOOT_FAILURE" | "CANCELLED" | "DEADLINE" | "DEADLINE_EXCEEDED"
        | "FAILED" | "NODE_FAIL" | "NODE_FAILURE" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "SPECIAL_EXIT" | "TIMEOUT" | "TIMED_OUT" => JobState::FinishedError,

        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD"
        | "RESV_DEL_HOLD" => JobState::Pending,

        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" | "SUSPENDED"
        | "STOPPED" => JobState::Running,

        _ => {
            tracing::warn!(
                native_state,
                "Unrecognized scheduler state, treating job as pending"
            );
            JobState::Pending
        }
    }
}
