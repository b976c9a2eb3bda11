//! Read model describing a job and its files to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::file_task::{FileStatus, FileTask};
use crate::id::JobId;
use crate::job::{Job, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub name: String,
    pub status: FileStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Job status plus per-file outcomes.
///
/// Per-file status is the only place partial failures show up: a `Completed`
/// job may still contain failed files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub file_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Result bundle, only for completed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub files: Vec<FileReport>,
}

impl JobReport {
    pub fn new(job: Job, files: Vec<FileTask>) -> Self {
        let download = match job.status {
            JobStatus::Completed => job.artifact.clone(),
            _ => None,
        };
        Self {
            job_id: job.id,
            status: job.status,
            file_count: job.file_count,
            completed_count: job.completed_count,
            failed_count: job.failed_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            download,
            error_message: job.error_message,
            files: files
                .into_iter()
                .map(|f| FileReport {
                    name: f.name,
                    status: f.status,
                    attempt: f.attempt,
                    error_message: f.error_message,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_task::FileTaskUpdate;

    #[test]
    fn download_only_offered_for_completed_jobs() {
        let mut job = Job::new(JobId::new(), 1);
        job.artifact = Some("out/job.zip".into());
        job.transition(JobStatus::InProgress, 0, 0).unwrap();

        let report = JobReport::new(job.clone(), vec![]);
        assert!(report.download.is_none());

        job.transition(JobStatus::Completed, 1, 0).unwrap();
        let report = JobReport::new(job, vec![]);
        assert_eq!(report.download.as_deref(), Some("out/job.zip"));
    }

    #[test]
    fn carries_per_file_errors() {
        let job = Job::new(JobId::new(), 1);
        let mut file = FileTask::new(job.id, "a.docx").unwrap();
        file.apply(FileTaskUpdate::Failed {
            error_message: "boom".into(),
        })
        .unwrap();

        let report = JobReport::new(job, vec![file]);
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].status, FileStatus::Failed);
        assert_eq!(report.files[0].error_message.as_deref(), Some("boom"));
    }
}
