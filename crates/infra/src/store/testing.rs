//! Job store wrapper with switchable outages, for failure-path tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use docbatch_core::{FileStatus, FileTask, FileTaskId, FileTaskUpdate, Job, JobId, JobStatus};

use super::{FinalizeClaim, InMemoryJobStore, JobStore, StoreError};

/// Delegates to an [`InMemoryJobStore`] unless told to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryJobStore,
    down: AtomicBool,
    fail_task_creation: AtomicBool,
    fail_status_update: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: InMemoryJobStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Every operation fails while down.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next_task_creation(&self) {
        self.fail_task_creation.store(true, Ordering::SeqCst);
    }

    /// The next `update_job_status` fails.
    pub fn fail_next_status_update(&self) {
        self.fail_status_update.store(true, Ordering::SeqCst);
    }

    fn check(&self, once: Option<&AtomicBool>) -> Result<(), StoreError> {
        let tripped = once.is_some_and(|flag| flag.swap(false, Ordering::SeqCst));
        if tripped || self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl JobStore for FlakyStore {
    fn create_job(&self, id: JobId, file_count: usize) -> Result<Job, StoreError> {
        self.check(None)?;
        self.inner.create_job(id, file_count)
    }

    fn create_file_tasks(
        &self,
        job_id: JobId,
        names: &[String],
    ) -> Result<Vec<FileTask>, StoreError> {
        self.check(Some(&self.fail_task_creation))?;
        self.inner.create_file_tasks(job_id, names)
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.check(None)?;
        self.inner.get_job(id)
    }

    fn find_file_task(&self, job_id: JobId, name: &str) -> Result<FileTask, StoreError> {
        self.check(None)?;
        self.inner.find_file_task(job_id, name)
    }

    fn list_file_tasks(&self, job_id: JobId) -> Result<Vec<FileTask>, StoreError> {
        self.check(None)?;
        self.inner.list_file_tasks(job_id)
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.check(None)?;
        self.inner.list_jobs_by_status(status)
    }

    fn update_file_task_status(
        &self,
        id: FileTaskId,
        update: FileTaskUpdate,
    ) -> Result<FileTask, StoreError> {
        self.check(None)?;
        self.inner.update_file_task_status(id, update)
    }

    fn count_file_tasks_by_status(
        &self,
        job_id: JobId,
        status: FileStatus,
    ) -> Result<usize, StoreError> {
        self.check(None)?;
        self.inner.count_file_tasks_by_status(job_id, status)
    }

    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> Result<Job, StoreError> {
        self.check(Some(&self.fail_status_update))?;
        self.inner
            .update_job_status(id, status, completed_count, failed_count)
    }

    fn set_job_result(
        &self,
        id: JobId,
        artifact: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.check(None)?;
        self.inner.set_job_result(id, artifact, error_message)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.check(None)?;
        self.inner.delete_job(id)
    }

    fn claim_finalization(
        &self,
        id: JobId,
        lease: Duration,
    ) -> Result<FinalizeClaim, StoreError> {
        self.check(None)?;
        self.inner.claim_finalization(id, lease)
    }

    fn release_finalization(&self, id: JobId) -> Result<(), StoreError> {
        self.check(None)?;
        self.inner.release_finalization(id)
    }
}
