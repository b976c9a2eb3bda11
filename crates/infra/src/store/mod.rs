//! Job store: the single source of truth for jobs and file tasks.
//!
//! Every orchestration decision (skip a redelivered task, finalize a job,
//! tolerate a deleted job) is made against what the store returns, never
//! against state cached in a worker or the coordinator.

pub mod in_memory;
pub mod postgres;
#[cfg(test)]
pub(crate) mod testing;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

use docbatch_core::{
    DomainError, FileStatus, FileTask, FileTaskId, FileTaskUpdate, Job, JobId, JobStatus,
};

/// Job store operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("file task not found: {0}")]
    FileTaskNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested change violates a state machine or counter invariant.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Backend unreachable or failed; nothing was changed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// The job (or one of its tasks) no longer exists, e.g. after deletion.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::JobNotFound(_) | StoreError::FileTaskNotFound(_)
        )
    }
}

/// Answer to [`JobStore::claim_finalization`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeClaim {
    /// Every file task is terminal and the caller now holds the claim.
    Acquired(Job),
    /// Some file tasks are not terminal yet.
    Outstanding,
    /// Another finalizer holds a claim that has not lapsed.
    Held,
    /// The job already has its terminal status.
    Terminal,
}

/// CRUD access to jobs and their file tasks.
///
/// Status updates are atomic per record: implementations validate the change
/// through the domain state machines and persist it in one step.
pub trait JobStore: Send + Sync {
    /// Create a `Pending` job expecting `file_count` tasks.
    fn create_job(&self, id: JobId, file_count: usize) -> Result<Job, StoreError>;

    /// Create one `Pending` task per name. Names must be unique within the job.
    fn create_file_tasks(&self, job_id: JobId, names: &[String])
        -> Result<Vec<FileTask>, StoreError>;

    fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    fn find_file_task(&self, job_id: JobId, name: &str) -> Result<FileTask, StoreError>;

    fn list_file_tasks(&self, job_id: JobId) -> Result<Vec<FileTask>, StoreError>;

    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    fn update_file_task_status(
        &self,
        id: FileTaskId,
        update: FileTaskUpdate,
    ) -> Result<FileTask, StoreError>;

    fn count_file_tasks_by_status(
        &self,
        job_id: JobId,
        status: FileStatus,
    ) -> Result<usize, StoreError>;

    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> Result<Job, StoreError>;

    /// Record the finalizer's bundle reference and/or failure message.
    fn set_job_result(
        &self,
        id: JobId,
        artifact: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    /// Delete the job and, by cascade, all of its file tasks.
    fn delete_job(&self, id: JobId) -> Result<(), StoreError>;

    /// Atomically claim the right to finalize a job.
    ///
    /// Granted to one caller at a time, only while the job is not terminal
    /// and all of its file tasks are. The claim lapses after `lease`, so a
    /// finalizer that died holding it does not wedge the job.
    fn claim_finalization(&self, id: JobId, lease: Duration)
        -> Result<FinalizeClaim, StoreError>;

    /// Drop a claim so finalization can be attempted again.
    fn release_finalization(&self, id: JobId) -> Result<(), StoreError>;
}

/// When a finalization claim taken at `now` lapses.
fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl<S> JobStore for std::sync::Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create_job(&self, id: JobId, file_count: usize) -> Result<Job, StoreError> {
        (**self).create_job(id, file_count)
    }

    fn create_file_tasks(
        &self,
        job_id: JobId,
        names: &[String],
    ) -> Result<Vec<FileTask>, StoreError> {
        (**self).create_file_tasks(job_id, names)
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        (**self).get_job(id)
    }

    fn find_file_task(&self, job_id: JobId, name: &str) -> Result<FileTask, StoreError> {
        (**self).find_file_task(job_id, name)
    }

    fn list_file_tasks(&self, job_id: JobId) -> Result<Vec<FileTask>, StoreError> {
        (**self).list_file_tasks(job_id)
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        (**self).list_jobs_by_status(status)
    }

    fn update_file_task_status(
        &self,
        id: FileTaskId,
        update: FileTaskUpdate,
    ) -> Result<FileTask, StoreError> {
        (**self).update_file_task_status(id, update)
    }

    fn count_file_tasks_by_status(
        &self,
        job_id: JobId,
        status: FileStatus,
    ) -> Result<usize, StoreError> {
        (**self).count_file_tasks_by_status(job_id, status)
    }

    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> Result<Job, StoreError> {
        (**self).update_job_status(id, status, completed_count, failed_count)
    }

    fn set_job_result(
        &self,
        id: JobId,
        artifact: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        (**self).set_job_result(id, artifact, error_message)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete_job(id)
    }

    fn claim_finalization(
        &self,
        id: JobId,
        lease: Duration,
    ) -> Result<FinalizeClaim, StoreError> {
        (**self).claim_finalization(id, lease)
    }

    fn release_finalization(&self, id: JobId) -> Result<(), StoreError> {
        (**self).release_finalization(id)
    }
}
