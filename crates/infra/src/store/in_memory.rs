//! In-memory job store for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use docbatch_core::{
    DomainError, FileStatus, FileTask, FileTaskId, FileTaskUpdate, Job, JobId, JobStatus,
};

use super::{lease_expiry, FinalizeClaim, JobStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    tasks: HashMap<FileTaskId, FileTask>,
    /// Task ids per job, in creation order.
    by_job: HashMap<JobId, Vec<FileTaskId>>,
    /// Finalization claims and when they lapse.
    leases: HashMap<JobId, DateTime<Utc>>,
}

/// In-memory job store.
///
/// One lock guards all tables, so every operation is atomic with respect to
/// every other. Not optimized for throughput.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self, id: JobId, file_count: usize) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&id) {
            return Err(StoreError::AlreadyExists(format!("job {id}")));
        }
        let job = Job::new(id, file_count);
        tables.jobs.insert(id, job.clone());
        tables.by_job.insert(id, Vec::new());
        Ok(job)
    }

    fn create_file_tasks(
        &self,
        job_id: JobId,
        names: &[String],
    ) -> Result<Vec<FileTask>, StoreError> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        let file_count = job.file_count;

        let existing: HashSet<&str> = tables
            .by_job
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.tasks.get(id))
            .map(|t| t.name.as_str())
            .collect();

        if existing.len() + names.len() > file_count {
            return Err(DomainError::invariant(format!(
                "job {job_id} expects {file_count} files, got {}",
                existing.len() + names.len()
            ))
            .into());
        }

        let mut seen = HashSet::new();
        let mut created = Vec::with_capacity(names.len());
        for name in names {
            if existing.contains(name.as_str()) || !seen.insert(name.as_str()) {
                return Err(StoreError::AlreadyExists(format!("file {name} in job {job_id}")));
            }
            created.push(FileTask::new(job_id, name.clone())?);
        }

        for task in &created {
            tables.tasks.insert(task.id, task.clone());
            tables.by_job.entry(job_id).or_default().push(task.id);
        }
        Ok(created)
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.read()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    fn find_file_task(&self, job_id: JobId, name: &str) -> Result<FileTask, StoreError> {
        let tables = self.read()?;
        let ids = tables
            .by_job
            .get(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        ids.iter()
            .filter_map(|id| tables.tasks.get(id))
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| StoreError::FileTaskNotFound(format!("{name} in job {job_id}")))
    }

    fn list_file_tasks(&self, job_id: JobId) -> Result<Vec<FileTask>, StoreError> {
        let tables = self.read()?;
        let ids = tables
            .by_job
            .get(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.tasks.get(id))
            .cloned()
            .collect())
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn update_file_task_status(
        &self,
        id: FileTaskId,
        update: FileTaskUpdate,
    ) -> Result<FileTask, StoreError> {
        let mut tables = self.write()?;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::FileTaskNotFound(id.to_string()))?;
        task.apply(update)?;
        Ok(task.clone())
    }

    fn count_file_tasks_by_status(
        &self,
        job_id: JobId,
        status: FileStatus,
    ) -> Result<usize, StoreError> {
        let tables = self.read()?;
        let ids = tables
            .by_job
            .get(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.tasks.get(id))
            .filter(|t| t.status == status)
            .count())
    }

    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.transition(status, completed_count, failed_count)?;
        Ok(job.clone())
    }

    fn set_job_result(
        &self,
        id: JobId,
        artifact: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.is_terminal() {
            return Err(DomainError::invariant(format!("job {id} is already finalized")).into());
        }
        job.artifact = artifact;
        job.error_message = error_message;
        job.updated_at = Utc::now();
        Ok(())
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.jobs.remove(&id).ok_or(StoreError::JobNotFound(id))?;
        for task_id in tables.by_job.remove(&id).unwrap_or_default() {
            tables.tasks.remove(&task_id);
        }
        tables.leases.remove(&id);
        Ok(())
    }

    fn claim_finalization(
        &self,
        id: JobId,
        lease: Duration,
    ) -> Result<FinalizeClaim, StoreError> {
        let mut tables = self.write()?;
        let job = tables.jobs.get(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.is_terminal() {
            return Ok(FinalizeClaim::Terminal);
        }
        let now = Utc::now();
        if tables.leases.get(&id).is_some_and(|until| *until > now) {
            return Ok(FinalizeClaim::Held);
        }
        let terminal = tables
            .by_job
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|task_id| tables.tasks.get(task_id))
            .filter(|t| t.is_terminal())
            .count();
        if terminal < job.file_count {
            return Ok(FinalizeClaim::Outstanding);
        }

        let job = job.clone();
        tables.leases.insert(id, lease_expiry(now, lease));
        Ok(FinalizeClaim::Acquired(job))
    }

    fn release_finalization(&self, id: JobId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !tables.jobs.contains_key(&id) {
            return Err(StoreError::JobNotFound(id));
        }
        tables.leases.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn seeded(list: &[&str]) -> (InMemoryJobStore, JobId, Vec<FileTask>) {
        let store = InMemoryJobStore::new();
        let job_id = JobId::new();
        store.create_job(job_id, list.len()).unwrap();
        let tasks = store.create_file_tasks(job_id, &names(list)).unwrap();
        (store, job_id, tasks)
    }

    #[test]
    fn creates_pending_job_and_tasks() {
        let (store, job_id, tasks) = seeded(&["a.docx", "b.docx"]);

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.file_count, 2);

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == FileStatus::Pending));
        let listed: Vec<_> = store
            .list_file_tasks(job_id)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(listed, names(&["a.docx", "b.docx"]));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let store = InMemoryJobStore::new();
        let job_id = JobId::new();
        store.create_job(job_id, 2).unwrap();

        let err = store
            .create_file_tasks(job_id, &names(&["a.docx", "a.docx"]))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(store.list_file_tasks(job_id).unwrap().is_empty());
    }

    #[test]
    fn more_tasks_than_declared_is_an_invariant_error() {
        let store = InMemoryJobStore::new();
        let job_id = JobId::new();
        store.create_job(job_id, 1).unwrap();

        let err = store
            .create_file_tasks(job_id, &names(&["a.docx", "b.docx"]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn counts_by_status() {
        let (store, job_id, tasks) = seeded(&["a.docx", "b.docx", "c.docx"]);
        store
            .update_file_task_status(tasks[0].id, FileTaskUpdate::Processing { attempt: 1 })
            .unwrap();
        store
            .update_file_task_status(
                tasks[0].id,
                FileTaskUpdate::Completed {
                    output_ref: "a.pdf".into(),
                },
            )
            .unwrap();
        store
            .update_file_task_status(
                tasks[1].id,
                FileTaskUpdate::Failed {
                    error_message: "bad".into(),
                },
            )
            .unwrap();

        let count = |s| store.count_file_tasks_by_status(job_id, s).unwrap();
        assert_eq!(count(FileStatus::Completed), 1);
        assert_eq!(count(FileStatus::Failed), 1);
        assert_eq!(count(FileStatus::Pending), 1);
    }

    #[test]
    fn illegal_transitions_surface_as_domain_errors() {
        let (store, _, tasks) = seeded(&["a.docx"]);
        store
            .update_file_task_status(
                tasks[0].id,
                FileTaskUpdate::Failed {
                    error_message: "bad".into(),
                },
            )
            .unwrap();

        let err = store
            .update_file_task_status(tasks[0].id, FileTaskUpdate::Processing { attempt: 1 })
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::InvalidTransition { .. })));
    }

    #[test]
    fn job_status_follows_state_machine() {
        let (store, job_id, _) = seeded(&["a.docx"]);
        store
            .update_job_status(job_id, JobStatus::InProgress, 0, 0)
            .unwrap();
        assert_eq!(
            store.list_jobs_by_status(JobStatus::InProgress).unwrap().len(),
            1
        );

        let job = store
            .update_job_status(job_id, JobStatus::Completed, 1, 0)
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        assert!(
            store
                .update_job_status(job_id, JobStatus::Failed, 1, 0)
                .is_err()
        );
    }

    #[test]
    fn result_cannot_change_after_finalization() {
        let (store, job_id, _) = seeded(&["a.docx"]);
        store
            .set_job_result(job_id, Some("bundle.zip".into()), None)
            .unwrap();
        store
            .update_job_status(job_id, JobStatus::Completed, 1, 0)
            .unwrap();

        assert!(store.set_job_result(job_id, None, Some("late".into())).is_err());
        assert_eq!(
            store.get_job(job_id).unwrap().artifact.as_deref(),
            Some("bundle.zip")
        );
    }

    fn resolve_all(store: &InMemoryJobStore, tasks: &[FileTask]) {
        for task in tasks {
            store
                .update_file_task_status(
                    task.id,
                    FileTaskUpdate::Failed {
                        error_message: "bad".into(),
                    },
                )
                .unwrap();
        }
    }

    #[test]
    fn finalization_claim_waits_for_every_task() {
        let (store, job_id, tasks) = seeded(&["a.docx", "b.docx"]);
        let lease = Duration::from_secs(60);

        resolve_all(&store, &tasks[..1]);
        assert_eq!(
            store.claim_finalization(job_id, lease).unwrap(),
            FinalizeClaim::Outstanding
        );

        resolve_all(&store, &tasks[1..]);
        assert!(matches!(
            store.claim_finalization(job_id, lease).unwrap(),
            FinalizeClaim::Acquired(job) if job.id == job_id
        ));
        assert_eq!(
            store.claim_finalization(job_id, lease).unwrap(),
            FinalizeClaim::Held
        );

        store
            .update_job_status(job_id, JobStatus::Failed, 0, 2)
            .unwrap();
        assert_eq!(
            store.claim_finalization(job_id, lease).unwrap(),
            FinalizeClaim::Terminal
        );
    }

    #[test]
    fn released_or_lapsed_claims_can_be_taken_again() {
        let (store, job_id, tasks) = seeded(&["a.docx"]);
        resolve_all(&store, &tasks);

        assert!(matches!(
            store.claim_finalization(job_id, Duration::from_secs(60)).unwrap(),
            FinalizeClaim::Acquired(_)
        ));
        store.release_finalization(job_id).unwrap();
        assert!(matches!(
            store.claim_finalization(job_id, Duration::ZERO).unwrap(),
            FinalizeClaim::Acquired(_)
        ));
        // A zero lease lapses immediately.
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            store.claim_finalization(job_id, Duration::from_secs(60)).unwrap(),
            FinalizeClaim::Acquired(_)
        ));

        store.delete_job(job_id).unwrap();
        assert!(store
            .claim_finalization(job_id, Duration::from_secs(60))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn delete_cascades_to_tasks() {
        let (store, job_id, tasks) = seeded(&["a.docx", "b.docx"]);
        store.delete_job(job_id).unwrap();

        assert!(store.get_job(job_id).unwrap_err().is_not_found());
        assert!(store.list_file_tasks(job_id).unwrap_err().is_not_found());
        let err = store
            .update_file_task_status(tasks[0].id, FileTaskUpdate::Processing { attempt: 1 })
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete_job(job_id).unwrap_err().is_not_found());
    }
}
