//! Worker runtime that executes tasks on the execution venue.
//!
//! The `taskfold` binary is what a job script invokes:
//!
//! - `taskfold version --output-file <job_dir>/version.json` runs first in
//!   every job and writes the [`VersionReport`](crate::version::VersionReport)
//! - `taskfold run --input-file <in> --output-file <out>` runs one task
//!
//! # Execution Flow
//!
//! 1. [`TaskExecutor::run_files`] decodes the input file with the restricted
//!    decoder
//! 2. [`TaskExecutor::execute`] spawns the entry point, payload on stdin
//! 3. stdout becomes the task value, a failure becomes an
//!    [`ExceptionProxy`](crate::channel::ExceptionProxy)
//! 4. The output file is written atomically so pollers never read half of it

pub mod executor;

pub use executor::{write_version_report, TaskExecutor};
