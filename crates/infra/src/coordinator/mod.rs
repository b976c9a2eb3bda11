//! Fan-out/fan-in coordinator.
//!
//! Fan-out: a submission becomes one job, one file task per document and
//! one queue message per task. Fan-in: workers report terminal tasks as
//! [`CompletionSignal`]s. The [`CompletionGate`] picks the report that
//! completes a job opened here; signals for jobs this process does not
//! track go straight to the [`Finalizer`], whose store claim decides
//! whether the job is ready and who finalizes it.

pub mod gate;
pub mod sweeper;

pub use gate::{CompletionGate, GateOutcome};
pub use sweeper::{Sweeper, SweeperHandle};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use docbatch_core::{
    ConversionKind, FileTask, FileTaskUpdate, JobId, JobReport, JobStatus,
};
use docbatch_events::{CompletionSignal, CompletionSink, SignalError, TaskMessage, TaskQueue};

use crate::error::{PipelineError, PipelineResult};
use crate::finalizer::{Finalization, Finalizer};
use crate::staging::StagingArea;
use crate::store::JobStore;

/// Result of [`Coordinator::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// In-progress jobs whose gate was reopened.
    pub reopened: usize,
    /// Jobs found complete and finalized on the spot.
    pub finalized: usize,
}

pub struct Coordinator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    gate: CompletionGate,
    finalizer: Finalizer,
    staging: Option<Arc<StagingArea>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn TaskQueue>, finalizer: Finalizer) -> Self {
        Self {
            store,
            queue,
            gate: CompletionGate::new(),
            finalizer,
            staging: None,
        }
    }

    /// Staging area for file and archive submission and job deletion.
    pub fn with_staging(mut self, staging: Arc<StagingArea>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn gate(&self) -> &CompletionGate {
        &self.gate
    }

    /// Submit a job over `names`. Inputs must be resolvable by the
    /// registered converters under the returned job id.
    pub fn submit(&self, names: Vec<String>) -> PipelineResult<JobId> {
        self.submit_with_id(JobId::new(), names)
    }

    /// Submit under a caller-chosen id (inputs staged ahead of time).
    ///
    /// Duplicate names are collapsed. Empty names, unsupported file types
    /// and distinct names that would convert to the same output file reject
    /// the whole submission before anything is stored. If storing or opening
    /// the job fails half way, whatever was stored is deleted again.
    #[instrument(skip(self, names), fields(job_id = %job_id))]
    pub fn submit_with_id(&self, job_id: JobId, names: Vec<String>) -> PipelineResult<JobId> {
        let tasks = plan_tasks(names)?;

        self.store.create_job(job_id, tasks.len())?;
        if let Err(e) = self.open_job(job_id, tasks) {
            error!(error = %e, "submission failed; discarding job");
            self.discard(job_id);
            return Err(e);
        }
        Ok(job_id)
    }

    fn open_job(&self, job_id: JobId, tasks: Vec<(String, ConversionKind)>) -> PipelineResult<()> {
        let names: Vec<String> = tasks.iter().map(|(name, _)| name.clone()).collect();
        let created = self.store.create_file_tasks(job_id, &names)?;
        info!(file_count = names.len(), "job submitted");

        if names.is_empty() {
            self.finalize(job_id)?;
            return Ok(());
        }

        self.store
            .update_job_status(job_id, JobStatus::InProgress, 0, 0)?;
        self.gate.open(job_id, names.len(), std::iter::empty());

        for ((name, kind), file) in tasks.into_iter().zip(created) {
            let message = TaskMessage::first_attempt(job_id, name, kind);
            if let Err(e) = self.queue.enqueue(message) {
                error!(file = %file.name, error = %e, "failed to enqueue task");
                self.fail_unqueued(&file, &e.to_string());
            }
        }
        Ok(())
    }

    /// Resolve a task that can never run, so the job still finishes.
    fn fail_unqueued(&self, file: &FileTask, reason: &str) {
        let update = FileTaskUpdate::Failed {
            error_message: format!("could not be queued: {reason}"),
        };
        match self.store.update_file_task_status(file.id, update) {
            Ok(failed) => {
                let signal = CompletionSignal {
                    job_id: failed.job_id,
                    file_task_id: failed.id,
                    status: failed.status,
                };
                if let Err(e) = CompletionSink::report(self, signal) {
                    warn!(file = %file.name, error = %e, "job left to the sweeper");
                }
            }
            Err(e) => error!(file = %file.name, error = %e, "failed to record enqueue failure"),
        }
    }

    /// Undo a half-stored submission.
    fn discard(&self, job_id: JobId) {
        self.gate.close(job_id);
        match self.store.delete_job(job_id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to delete discarded job"),
        }
        if let Some(staging) = &self.staging {
            if let Err(e) = staging.cleanup(job_id) {
                warn!(job_id = %job_id, error = %e, "failed to release storage of discarded job");
            }
        }
    }

    /// Extract the documents of a zip archive and submit them as one job.
    pub fn submit_archive(&self, archive: &Path) -> PipelineResult<JobId> {
        let staging = self.staging()?;
        let job_id = JobId::new();
        let submitted = staging
            .extract_archive(job_id, archive)
            .map_err(PipelineError::from)
            .and_then(|names| {
                if names.is_empty() {
                    warn!(job_id = %job_id, archive = %archive.display(), "archive holds no convertible documents");
                }
                self.submit_with_id(job_id, names)
            });
        if submitted.is_err() {
            let _ = staging.cleanup(job_id);
        }
        submitted
    }

    /// Stage local files and submit them as one job.
    ///
    /// Files are staged by base name, so two paths with the same base name
    /// reject the submission.
    pub fn submit_files<P: AsRef<Path>>(&self, paths: &[P]) -> PipelineResult<JobId> {
        let staging = self.staging()?;
        let mut seen = HashSet::new();
        for path in paths {
            let path = path.as_ref();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if ConversionKind::from_filename(name).is_none() {
                return Err(PipelineError::input(format!(
                    "unsupported file type: {}",
                    path.display()
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(PipelineError::input(format!(
                    "more than one file named {name}: {}",
                    path.display()
                )));
            }
        }

        let job_id = JobId::new();
        let mut names = Vec::with_capacity(paths.len());
        for path in paths {
            match staging.stage_file(job_id, path.as_ref()) {
                Ok(name) => names.push(name),
                Err(e) => {
                    let _ = staging.cleanup(job_id);
                    return Err(e.into());
                }
            }
        }
        let submitted = self.submit_with_id(job_id, names);
        if submitted.is_err() {
            let _ = staging.cleanup(job_id);
        }
        submitted
    }

    /// Current job status with per-file outcomes.
    pub fn job_report(&self, job_id: JobId) -> PipelineResult<JobReport> {
        let job = self.store.get_job(job_id)?;
        let files = self.store.list_file_tasks(job_id)?;
        Ok(JobReport::new(job, files))
    }

    /// Poll until the job is terminal or `timeout` passes; returns the last
    /// report either way.
    pub fn wait(&self, job_id: JobId, timeout: Duration, poll: Duration) -> PipelineResult<JobReport> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.job_report(job_id)?;
            if report.status.is_terminal() || Instant::now() >= deadline {
                return Ok(report);
            }
            thread::sleep(poll);
        }
    }

    /// Cancel and delete a job: close its gate, delete the records and
    /// release its storage. Queued tasks for it are dropped by workers.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn delete_job(&self, job_id: JobId) -> PipelineResult<()> {
        self.gate.close(job_id);
        self.store.delete_job(job_id)?;
        if let Some(staging) = &self.staging {
            if let Err(e) = staging.cleanup(job_id) {
                warn!(error = %e, "failed to release job storage");
            }
        }
        info!("job deleted");
        Ok(())
    }

    /// Rebuild gate entries after a restart.
    ///
    /// Every `InProgress` job gets its gate back, seeded with the tasks the
    /// store already holds as terminal; jobs with nothing outstanding are
    /// finalized immediately.
    pub fn recover(&self) -> PipelineResult<Recovery> {
        let mut recovery = Recovery::default();
        for job in self.store.list_jobs_by_status(JobStatus::InProgress)? {
            let terminal = match self.store.list_file_tasks(job.id) {
                Ok(files) => files
                    .into_iter()
                    .filter(|f| f.is_terminal())
                    .map(|f| f.id)
                    .collect::<Vec<_>>(),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };

            if self.gate.open(job.id, job.file_count, terminal) {
                if let Ok(Finalization::Finalized(_)) = self.finalize(job.id) {
                    recovery.finalized += 1;
                }
            } else {
                recovery.reopened += 1;
            }
        }
        info!(
            reopened = recovery.reopened,
            finalized = recovery.finalized,
            "coordinator recovered"
        );
        Ok(recovery)
    }

    /// Finalize every in-progress job that is ready, whoever it was
    /// submitted by, and drop gate entries of jobs that were finalized or
    /// deleted elsewhere. Returns how many jobs this call finalized.
    ///
    /// Catches jobs whose last signal was lost: a finalization that failed,
    /// or a process that died between resolving a task and signalling it.
    pub fn sweep(&self) -> PipelineResult<usize> {
        let in_progress = self.store.list_jobs_by_status(JobStatus::InProgress)?;
        let mut still_open = HashSet::with_capacity(in_progress.len());
        let mut finalized = 0;

        for job in in_progress {
            match self.finalize(job.id) {
                Ok(Finalization::Finalized(_)) => {
                    self.gate.close(job.id);
                    finalized += 1;
                }
                Ok(Finalization::Deferred) => {
                    still_open.insert(job.id);
                }
                Ok(Finalization::AlreadyFinal | Finalization::Gone) => {
                    self.gate.close(job.id);
                }
                Err(_) => {
                    still_open.insert(job.id);
                }
            }
        }

        for job_id in self.gate.job_ids() {
            if !still_open.contains(&job_id) {
                // Finalized or deleted by another process.
                self.gate.close(job_id);
            }
        }
        if finalized > 0 {
            info!(finalized, "sweep finalized stalled jobs");
        }
        Ok(finalized)
    }

    fn finalize(&self, job_id: JobId) -> PipelineResult<Finalization> {
        let result = self.finalizer.finalize(job_id);
        match &result {
            Ok(Finalization::Finalized(job)) => {
                debug!(job_id = %job_id, status = %job.status, "finalization done");
            }
            Ok(_) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "finalization failed; will retry"),
        }
        result
    }

    fn staging(&self) -> PipelineResult<&Arc<StagingArea>> {
        self.staging
            .as_ref()
            .ok_or_else(|| PipelineError::system("coordinator has no staging area"))
    }
}

/// Validate and deduplicate submitted names, resolving each to its
/// conversion.
fn plan_tasks(names: Vec<String>) -> PipelineResult<Vec<(String, ConversionKind)>> {
    let mut seen = HashSet::new();
    // Output names are compared case-insensitively: staging may sit on a
    // case-insensitive filesystem.
    let mut outputs: HashMap<String, String> = HashMap::new();
    let mut tasks = Vec::with_capacity(names.len());
    for name in names {
        if name.trim().is_empty() {
            return Err(PipelineError::input("file name must not be empty"));
        }
        let kind = ConversionKind::from_filename(&name)
            .ok_or_else(|| PipelineError::input(format!("unsupported file type: {name}")))?;
        if !seen.insert(name.clone()) {
            continue;
        }
        let output = kind.output_name(&name).to_lowercase();
        if let Some(other) = outputs.insert(output, name.clone()) {
            return Err(PipelineError::input(format!(
                "{other} and {name} would both convert to {}",
                kind.output_name(&name)
            )));
        }
        tasks.push((name, kind));
    }
    Ok(tasks)
}

impl CompletionSink for Coordinator {
    fn report(&self, signal: CompletionSignal) -> Result<(), SignalError> {
        let job_id = signal.job_id;
        match self.gate.report(job_id, signal.file_task_id) {
            GateOutcome::Pending {
                reported,
                file_count,
            } => {
                debug!(job_id = %job_id, reported, file_count, status = %signal.status, "file task resolved");
                Ok(())
            }
            GateOutcome::Duplicate => {
                debug!(job_id = %job_id, file_task_id = %signal.file_task_id, "duplicate completion signal");
                Ok(())
            }
            // Unknown: opened by another process, already released here, or
            // deleted. The store claim tells which, and admits one finalizer.
            GateOutcome::Released | GateOutcome::Unknown => self
                .finalize(job_id)
                .map(|_| ())
                .map_err(|e| SignalError(e.to_string())),
        }
    }
}
