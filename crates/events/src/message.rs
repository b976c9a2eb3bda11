//! Messages exchanged between the coordinator, the queue and workers.

use serde::{Deserialize, Serialize};

use docbatch_core::{ConversionKind, FileStatus, FileTaskId, JobId};

/// One unit of conversion work on the queue.
///
/// Plain fields only; this is the wire format for durable queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    pub filename: String,
    /// 1-based attempt this message represents.
    pub attempt: u32,
    pub kind: ConversionKind,
}

impl TaskMessage {
    pub fn first_attempt(job_id: JobId, filename: impl Into<String>, kind: ConversionKind) -> Self {
        Self {
            job_id,
            filename: filename.into(),
            attempt: 1,
            kind,
        }
    }

    /// The same task, one attempt later.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Report that a file task reached a terminal status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub job_id: JobId,
    pub file_task_id: FileTaskId,
    pub status: FileStatus,
}

/// A sink could not act on a signal; the sender should re-send it later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("completion signal not processed: {0}")]
pub struct SignalError(pub String);

/// Receiver of completion signals (the fan-in side of a job).
///
/// Implementations must tolerate duplicates and signals for jobs they no
/// longer track: workers re-send signals after redelivery, and after an
/// `Err` from [`CompletionSink::report`].
pub trait CompletionSink: Send + Sync {
    fn report(&self, signal: CompletionSignal) -> Result<(), SignalError>;
}

impl<S> CompletionSink for std::sync::Arc<S>
where
    S: CompletionSink + ?Sized,
{
    fn report(&self, signal: CompletionSignal) -> Result<(), SignalError> {
        (**self).report(signal)
    }
}
