//! `docbatch-core`: batch conversion domain model.
//!
//! Jobs, file tasks and the state machines that govern them. This crate is
//! **pure domain**: no storage, queueing or threading concerns.

pub mod conversion;
pub mod error;
pub mod file_task;
pub mod id;
pub mod job;
pub mod report;

pub use conversion::ConversionKind;
pub use error::{DomainError, DomainResult};
pub use file_task::{FileStatus, FileTask, FileTaskUpdate};
pub use id::{FileTaskId, JobId};
pub use job::{Job, JobStatus};
pub use report::{FileReport, JobReport};
