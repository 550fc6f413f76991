use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use taskfold::shutdown::install_shutdown_handler;
use taskfold::version::VersionReport;
use taskfold::worker::{write_version_report, TaskExecutor};

#[derive(Parser, Debug)]
#[command(name = "taskfold")]
#[command(version)]
#[command(about = "Worker runtime executing taskfold tasks on an execution venue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one task from its input file
    Run {
        /// Task input file written by the controller
        #[arg(long)]
        input_file: PathBuf,

        /// Where to write the task's result or exception
        #[arg(long)]
        output_file: PathBuf,

        /// Reject input files above this size
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        max_payload_bytes: usize,
    },

    /// Report the versions this worker was built with
    Version {
        /// Write the report here instead of stdout
        #[arg(long)]
        output_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // stdout is reserved for results
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run {
            input_file,
            output_file,
            max_payload_bytes,
        } => {
            let shutdown = match install_shutdown_handler() {
                Ok(token) => token,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return ExitCode::FAILURE;
                }
            };
            let executor = TaskExecutor::new(max_payload_bytes);
            match executor
                .run_files(&input_file, &output_file, &shutdown)
                .await
            {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => {
                    tracing::error!(
                        input = %input_file.display(),
                        output = %output_file.display(),
                        error = %e,
                        "Task could not be run"
                    );
                    ExitCode::from(2)
                }
            }
        }
        Commands::Version { output_file } => {
            let report = VersionReport::current();
            tracing::debug!(
                interpreter = %report.interpreter_string(),
                controller_software = %report.controller_software,
                "Writing version report"
            );
            match write_version_report(output_file.as_deref()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to write version report");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
