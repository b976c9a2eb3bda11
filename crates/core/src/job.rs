//! Batch job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Lifecycle status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, tasks not yet enqueued.
    Pending,
    /// Tasks enqueued; waiting on the completion gate.
    InProgress,
    /// At least one file converted.
    Completed,
    /// Nothing converted, or finalization failed.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Outcome of a job whose file tasks are all terminal.
    ///
    /// All-failed (including the zero-file job) is `Failed`; any success is
    /// `Completed`, partial failures included.
    pub fn resolve(file_count: usize, completed_count: usize, failed_count: usize) -> Self {
        if failed_count == file_count {
            JobStatus::Failed
        } else if completed_count > 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }

    fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (Pending | InProgress, Completed | Failed) => true,
            (InProgress, InProgress) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A submitted batch of file conversions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Number of file tasks; fixed at creation.
    pub file_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Result bundle reference, set by the finalizer.
    pub artifact: Option<String>,
    /// Finalization failure, if any.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, file_count: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            file_count,
            completed_count: 0,
            failed_count: 0,
            artifact: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status` with freshly derived counters.
    ///
    /// Counters never decrease and never exceed `file_count`; a terminal status
    /// requires every file to be accounted for. Terminal jobs are frozen.
    pub fn transition(
        &mut self,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(status) {
            return Err(DomainError::transition("job", self.status, status));
        }
        if completed_count < self.completed_count || failed_count < self.failed_count {
            return Err(DomainError::invariant(format!(
                "job {} counters moved backwards ({}/{} -> {}/{})",
                self.id, self.completed_count, self.failed_count, completed_count, failed_count
            )));
        }

        let candidate = Job {
            status,
            completed_count,
            failed_count,
            ..self.clone()
        };
        candidate.check_invariant()?;

        self.status = status;
        self.completed_count = completed_count;
        self.failed_count = failed_count;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `completed + failed <= file_count`, with equality exactly when terminal.
    ///
    /// A zero-file job trivially has equality; it is only ever non-terminal in
    /// the instant between creation and its immediate finalization.
    pub fn check_invariant(&self) -> DomainResult<()> {
        let resolved = self.completed_count + self.failed_count;
        if resolved > self.file_count {
            return Err(DomainError::invariant(format!(
                "job {}: {} resolved files exceed file_count {}",
                self.id, resolved, self.file_count
            )));
        }
        let all_resolved = resolved == self.file_count;
        if self.file_count > 0 && all_resolved != self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {}: status {} with {}/{} files resolved",
                self.id, self.status, resolved, self.file_count
            )));
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn started(file_count: usize) -> Job {
        let mut job = Job::new(JobId::new(), file_count);
        job.transition(JobStatus::InProgress, 0, 0).unwrap();
        job
    }

    #[test]
    fn partial_success_counts_as_completed() {
        assert_eq!(JobStatus::resolve(3, 2, 1), JobStatus::Completed);
    }

    #[test]
    fn all_failed_is_failed() {
        assert_eq!(JobStatus::resolve(3, 0, 3), JobStatus::Failed);
    }

    #[test]
    fn zero_files_is_failed() {
        assert_eq!(JobStatus::resolve(0, 0, 0), JobStatus::Failed);
    }

    #[test]
    fn lifecycle_to_completed() {
        let mut job = started(3);
        assert_eq!(job.status, JobStatus::InProgress);

        job.transition(JobStatus::Completed, 2, 1).unwrap();
        assert!(job.is_terminal());
        assert_eq!(job.completed_count, 2);
        assert_eq!(job.failed_count, 1);
    }

    #[test]
    fn terminal_jobs_are_frozen() {
        let mut job = started(1);
        job.transition(JobStatus::Failed, 0, 1).unwrap();

        let err = job.transition(JobStatus::Completed, 1, 0).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        let err = job.transition(JobStatus::InProgress, 0, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_status_requires_every_file_resolved() {
        let mut job = started(3);
        let err = job.transition(JobStatus::Completed, 1, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[test]
    fn counters_cannot_exceed_file_count() {
        let mut job = started(2);
        let err = job.transition(JobStatus::Completed, 2, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn zero_file_job_fails_straight_from_pending() {
        let mut job = Job::new(JobId::new(), 0);
        job.transition(JobStatus::Failed, 0, 0).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Whatever mix of outcomes a job ends with, finalizing it with the
        /// resolved status satisfies the counter invariant.
        #[test]
        fn resolved_status_always_satisfies_invariant(
            file_count in 0usize..50,
            split in 0usize..50,
        ) {
            let completed = split.min(file_count);
            let failed = file_count - completed;
            let mut job = Job::new(JobId::new(), file_count);
            if file_count > 0 {
                job.transition(JobStatus::InProgress, 0, 0).unwrap();
            }

            let status = JobStatus::resolve(file_count, completed, failed);
            job.transition(status, completed, failed).unwrap();

            prop_assert!(job.check_invariant().is_ok());
            prop_assert_eq!(job.status == JobStatus::Completed, completed > 0);
        }

        /// Non-terminal jobs never accept counters that account for every file.
        #[test]
        fn in_progress_never_holds_full_counts(
            file_count in 1usize..50,
            completed in 0usize..50,
        ) {
            let completed = completed.min(file_count);
            let failed = file_count - completed;
            let mut job = started(file_count);
            prop_assert!(job.transition(JobStatus::InProgress, completed, failed).is_err());
        }
    }
}
