//! Finalizer: turns a job whose file tasks are all terminal into a
//! terminal job.
//!
//! Every run starts by claiming the job in the store, so at most one
//! finalizer works on a job at a time across all processes sharing the
//! store. A failed run releases its claim; a crashed one lets it lapse.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use docbatch_core::{FileStatus, Job, JobId, JobStatus};

use crate::bundle::ResultBundler;
use crate::error::{PipelineError, PipelineResult};
use crate::staging::StagingArea;
use crate::store::{FinalizeClaim, JobStore, StoreError};

/// How long a finalization claim holds before another process may take over.
pub const DEFAULT_FINALIZE_LEASE: Duration = Duration::from_secs(300);

/// What a finalizer invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    /// The job reached its terminal status.
    Finalized(Job),
    /// The job was already terminal; nothing changed.
    AlreadyFinal,
    /// Tasks are still outstanding, or another finalizer holds the job.
    Deferred,
    /// The job no longer exists (deleted before or during finalization).
    Gone,
}

/// Aggregates terminal file states into the job outcome and bundles the
/// successful outputs.
///
/// Counts are always re-read from the store, never taken from the caller.
pub struct Finalizer {
    store: Arc<dyn JobStore>,
    bundler: Arc<dyn ResultBundler>,
    staging: Option<Arc<StagingArea>>,
    lease: Duration,
}

impl Finalizer {
    pub fn new(store: Arc<dyn JobStore>, bundler: Arc<dyn ResultBundler>) -> Self {
        Self {
            store,
            bundler,
            staging: None,
            lease: DEFAULT_FINALIZE_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Staging area to release when the job turns out to be deleted.
    pub fn with_staging(mut self, staging: Arc<StagingArea>) -> Self {
        self.staging = Some(staging);
        self
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn finalize(&self, job_id: JobId) -> PipelineResult<Finalization> {
        let job = match self.store.claim_finalization(job_id, self.lease) {
            Ok(FinalizeClaim::Acquired(job)) => job,
            Ok(FinalizeClaim::Terminal) => {
                debug!("job already finalized");
                return Ok(Finalization::AlreadyFinal);
            }
            Ok(claim) => {
                debug!(?claim, "finalization deferred");
                return Ok(Finalization::Deferred);
            }
            Err(e) if e.is_not_found() => return Ok(self.gone(job_id, "before finalization")),
            Err(e) => return Err(e.into()),
        };

        let result = self.finalize_claimed(&job);
        if result.is_err() {
            // Let the next attempt claim the job right away.
            if let Err(e) = self.store.release_finalization(job_id) {
                if !e.is_not_found() {
                    warn!(error = %e, "failed to release finalization claim; waiting for it to lapse");
                }
            }
        }
        result
    }

    fn finalize_claimed(&self, job: &Job) -> PipelineResult<Finalization> {
        let job_id = job.id;
        let completed = self.count(job_id, FileStatus::Completed);
        let failed = self.count(job_id, FileStatus::Failed);
        let (completed, failed) = match (completed, failed) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(e), _) | (_, Err(e)) if e.is_not_found() => {
                return Ok(self.gone(job_id, "while counting"));
            }
            (Err(e), _) | (_, Err(e)) => return Err(e.into()),
        };

        if completed + failed != job.file_count {
            return Err(PipelineError::system(format!(
                "job {job_id} has {} of {} file tasks terminal",
                completed + failed,
                job.file_count
            )));
        }

        let mut status = JobStatus::resolve(job.file_count, completed, failed);
        if completed > 0 {
            match self.bundle(job_id) {
                Ok(artifact) => {
                    if let Err(e) = self.store.set_job_result(job_id, Some(artifact), None) {
                        return self.write_failed(job_id, e);
                    }
                }
                Err(PipelineError::Finalization(message)) => {
                    error!(error = %message, "bundling failed; failing job");
                    status = JobStatus::Failed;
                    if let Err(e) = self.store.set_job_result(job_id, None, Some(message)) {
                        return self.write_failed(job_id, e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match self.store.update_job_status(job_id, status, completed, failed) {
            Ok(job) => {
                info!(
                    status = %job.status,
                    completed_count = completed,
                    failed_count = failed,
                    "job finalized"
                );
                Ok(Finalization::Finalized(job))
            }
            Err(e) => self.write_failed(job_id, e),
        }
    }

    fn count(&self, job_id: JobId, status: FileStatus) -> Result<usize, StoreError> {
        self.store.count_file_tasks_by_status(job_id, status)
    }

    fn bundle(&self, job_id: JobId) -> PipelineResult<String> {
        let outputs: Vec<String> = self
            .store
            .list_file_tasks(job_id)?
            .into_iter()
            .filter(|t| t.status == FileStatus::Completed)
            .filter_map(|t| t.output_ref)
            .collect();
        Ok(self.bundler.bundle(job_id, &outputs)?)
    }

    fn write_failed(&self, job_id: JobId, err: StoreError) -> PipelineResult<Finalization> {
        if err.is_not_found() {
            return Ok(self.gone(job_id, "during finalization"));
        }
        Err(err.into())
    }

    fn gone(&self, job_id: JobId, when: &str) -> Finalization {
        info!(job_id = %job_id, "job deleted {when}; nothing to finalize");
        if let Some(staging) = &self.staging {
            if let Err(e) = staging.cleanup(job_id) {
                warn!(job_id = %job_id, error = %e, "failed to release storage of deleted job");
            }
        }
        Finalization::Gone
    }
}
