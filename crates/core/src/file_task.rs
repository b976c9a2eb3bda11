//! Per-file unit of conversion work and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{FileTaskId, JobId};

/// Externally observable status of a file task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Pending,
    /// Being converted, or waiting for a retry.
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "PENDING",
            FileStatus::Processing => "PROCESSING",
            FileStatus::Completed => "COMPLETED",
            FileStatus::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for FileStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FileStatus::Pending),
            "PROCESSING" => Ok(FileStatus::Processing),
            "COMPLETED" => Ok(FileStatus::Completed),
            "FAILED" => Ok(FileStatus::Failed),
            other => Err(DomainError::validation(format!("unknown file status: {other}"))),
        }
    }
}

/// A requested change to a file task, validated by [`FileTask::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileTaskUpdate {
    /// A worker started (or restarted after redelivery) this attempt.
    Processing { attempt: u32 },
    /// The current attempt failed transiently; `attempt` is the next one.
    Retrying { attempt: u32 },
    Completed { output_ref: String },
    Failed { error_message: String },
}

impl FileTaskUpdate {
    pub fn target_status(&self) -> FileStatus {
        match self {
            FileTaskUpdate::Processing { .. } | FileTaskUpdate::Retrying { .. } => {
                FileStatus::Processing
            }
            FileTaskUpdate::Completed { .. } => FileStatus::Completed,
            FileTaskUpdate::Failed { .. } => FileStatus::Failed,
        }
    }
}

/// One file's conversion inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    pub id: FileTaskId,
    pub job_id: JobId,
    /// Source file name; unique within the job.
    pub name: String,
    pub status: FileStatus,
    /// Set only while `Failed`.
    pub error_message: Option<String>,
    /// Set only while `Completed`.
    pub output_ref: Option<String>,
    /// Most recently started attempt (1-based, 0 while pending).
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileTask {
    pub fn new(job_id: JobId, name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("file task name must not be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            id: FileTaskId::new(),
            job_id,
            name,
            status: FileStatus::Pending,
            error_message: None,
            output_ref: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply `update`, enforcing `Pending -> Processing -> {Completed | Failed}`.
    ///
    /// Terminal tasks reject every update. Attempts never move backwards.
    pub fn apply(&mut self, update: FileTaskUpdate) -> DomainResult<()> {
        let next = update.target_status();
        if self.status.is_terminal() {
            return Err(DomainError::transition("file task", self.status, next));
        }

        match update {
            FileTaskUpdate::Processing { attempt } => {
                if attempt == 0 || attempt < self.attempt {
                    return Err(DomainError::invariant(format!(
                        "file task {}: attempt {} cannot follow attempt {}",
                        self.id, attempt, self.attempt
                    )));
                }
                self.attempt = attempt;
            }
            FileTaskUpdate::Retrying { attempt } => {
                if self.status != FileStatus::Processing {
                    return Err(DomainError::transition("file task", self.status, next));
                }
                if attempt <= self.attempt {
                    return Err(DomainError::invariant(format!(
                        "file task {}: retry attempt {} must exceed {}",
                        self.id, attempt, self.attempt
                    )));
                }
                self.attempt = attempt;
            }
            FileTaskUpdate::Completed { output_ref } => {
                if self.status != FileStatus::Processing {
                    return Err(DomainError::transition("file task", self.status, next));
                }
                self.error_message = None;
                self.output_ref = Some(output_ref);
            }
            FileTaskUpdate::Failed { error_message } => {
                self.output_ref = None;
                self.error_message = Some(error_message);
            }
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> FileTask {
        FileTask::new(JobId::new(), "report.docx").unwrap()
    }

    #[test]
    fn empty_names_are_rejected() {
        assert!(matches!(
            FileTask::new(JobId::new(), "  "),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn happy_path() {
        let mut t = task();
        t.apply(FileTaskUpdate::Processing { attempt: 1 }).unwrap();
        assert_eq!(t.status, FileStatus::Processing);
        assert_eq!(t.attempt, 1);

        t.apply(FileTaskUpdate::Completed {
            output_ref: "report.pdf".into(),
        })
        .unwrap();
        assert_eq!(t.status, FileStatus::Completed);
        assert_eq!(t.output_ref.as_deref(), Some("report.pdf"));
        assert!(t.error_message.is_none());
    }

    #[test]
    fn retry_keeps_task_processing() {
        let mut t = task();
        t.apply(FileTaskUpdate::Processing { attempt: 1 }).unwrap();
        t.apply(FileTaskUpdate::Retrying { attempt: 2 }).unwrap();
        assert_eq!(t.status, FileStatus::Processing);
        assert_eq!(t.attempt, 2);

        // Redelivery of the same attempt is allowed.
        t.apply(FileTaskUpdate::Processing { attempt: 2 }).unwrap();
        t.apply(FileTaskUpdate::Processing { attempt: 2 }).unwrap();
        assert_eq!(t.attempt, 2);
    }

    #[test]
    fn attempts_never_go_backwards() {
        let mut t = task();
        t.apply(FileTaskUpdate::Processing { attempt: 2 }).unwrap();
        assert!(t.apply(FileTaskUpdate::Processing { attempt: 1 }).is_err());
        assert!(t.apply(FileTaskUpdate::Retrying { attempt: 2 }).is_err());
    }

    #[test]
    fn failure_records_error_message() {
        let mut t = task();
        t.apply(FileTaskUpdate::Processing { attempt: 1 }).unwrap();
        t.apply(FileTaskUpdate::Failed {
            error_message: "corrupt archive member".into(),
        })
        .unwrap();
        assert_eq!(t.status, FileStatus::Failed);
        assert_eq!(t.error_message.as_deref(), Some("corrupt archive member"));
    }

    #[test]
    fn pending_task_can_fail_on_bad_input() {
        let mut t = task();
        t.apply(FileTaskUpdate::Failed {
            error_message: "missing input".into(),
        })
        .unwrap();
        assert_eq!(t.status, FileStatus::Failed);
        assert_eq!(t.attempt, 0);
    }

    #[test]
    fn pending_task_cannot_complete_without_processing() {
        let mut t = task();
        let err = t
            .apply(FileTaskUpdate::Completed {
                output_ref: "x.pdf".into(),
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = task();
        t.apply(FileTaskUpdate::Processing { attempt: 1 }).unwrap();
        t.apply(FileTaskUpdate::Completed {
            output_ref: "a.pdf".into(),
        })
        .unwrap();

        for update in [
            FileTaskUpdate::Processing { attempt: 2 },
            FileTaskUpdate::Retrying { attempt: 2 },
            FileTaskUpdate::Failed {
                error_message: "late".into(),
            },
        ] {
            assert!(matches!(
                t.apply(update),
                Err(DomainError::InvalidTransition { .. })
            ));
        }
        assert_eq!(t.status, FileStatus::Completed);
    }

    #[test]
    fn updates_serialize_with_type_tag() {
        let json = serde_json::to_value(FileTaskUpdate::Retrying { attempt: 3 }).unwrap();
        assert_eq!(json["type"], "retrying");
        assert_eq!(json["attempt"], 3);
    }
}
