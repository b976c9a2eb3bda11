//! `docbatch`: run batch document conversions from the command line.
//!
//! A thin shim over `docbatch-infra`: flags override the environment
//! configuration, job reports are printed as JSON on stdout and logs go to
//! stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use docbatch_core::{JobId, JobStatus};
use docbatch_infra::{Pipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(
    name = "docbatch",
    version,
    about = "Convert batches of .docx and .txt documents to PDF"
)]
struct Cli {
    /// Staging root for inputs, outputs and bundles.
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Worker threads.
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit files (or one .zip archive) as a job and wait for the result.
    Run {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Give up waiting after this many seconds.
        #[arg(long, env = "DOCBATCH_TIMEOUT_SECS", default_value_t = 300)]
        timeout: u64,
    },

    /// Process queued tasks and sweep ready jobs until interrupted (shared
    /// store and queue).
    Serve,

    /// Print the report of a job. Starts no workers.
    Status { job_id: JobId },

    /// Cancel a job and delete its records and files. Starts no workers.
    Delete { job_id: JobId },
}

fn main() -> ExitCode {
    docbatch_observability::init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = PipelineConfig::from_env().context("invalid configuration")?;
    if let Some(storage) = cli.storage {
        config.storage_path = storage;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    let poll = config.poll_interval;

    // Status and Delete leave the tasks to whichever process serves them.
    let pipeline = match cli.command {
        Command::Status { .. } | Command::Delete { .. } => Pipeline::open(config),
        Command::Run { .. } | Command::Serve => Pipeline::start(config),
    }
    .context("failed to start pipeline")?;
    let coordinator = pipeline.coordinator().clone();

    let code = match cli.command {
        Command::Run { inputs, timeout } => {
            let job_id = match inputs.as_slice() {
                [archive] if is_zip(archive) => coordinator.submit_archive(archive),
                _ => coordinator.submit_files(&inputs),
            }
            .context("submission rejected")?;
            info!(job_id = %job_id, "waiting for job");

            let report = coordinator.wait(job_id, Duration::from_secs(timeout), poll)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            match report.status {
                JobStatus::Completed => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            }
        }
        Command::Serve => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            info!("serving; press Ctrl-C to stop");
            runtime.block_on(tokio::signal::ctrl_c())?;
            ExitCode::SUCCESS
        }
        Command::Status { job_id } => {
            let report = coordinator.job_report(job_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            ExitCode::SUCCESS
        }
        Command::Delete { job_id } => {
            coordinator.delete_job(job_id)?;
            println!("deleted {job_id}");
            ExitCode::SUCCESS
        }
    };

    let stats = pipeline.shutdown();
    info!(processed = stats.processed, completed = stats.completed, failed = stats.failed, "done");
    Ok(code)
}

fn is_zip(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}
