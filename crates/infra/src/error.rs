//! Pipeline error taxonomy.
//!
//! Component errors are folded into four classes that decide what the
//! pipeline does next:
//!
//! | Class | Effect |
//! |-------|--------|
//! | `Input` | file task marked `Failed` at once, no retry |
//! | `Transient` | retried with backoff until attempts run out |
//! | `System` | step aborted without state change; delivery is nacked |
//! | `Finalization` | job forced to `Failed`, not retried |

use docbatch_events::QueueError;

use crate::bundle::BundleError;
use crate::config::ConfigError;
use crate::conversion::ConvertError;
use crate::staging::StagingError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("system error: {0}")]
    System(String),

    #[error("finalization error: {0}")]
    Finalization(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            // A refused state change is a bug or a race, not bad input.
            StoreError::Domain(_) | StoreError::Unavailable(_) => Self::System(err.to_string()),
            StoreError::JobNotFound(_)
            | StoreError::FileTaskNotFound(_)
            | StoreError::AlreadyExists(_) => Self::Input(err.to_string()),
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        Self::System(err.to_string())
    }
}

impl From<ConvertError> for PipelineError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::Input(msg) => Self::Input(msg),
            ConvertError::Transient(msg) => Self::Transient(msg),
        }
    }
}

impl From<BundleError> for PipelineError {
    fn from(err: BundleError) -> Self {
        Self::Finalization(err.to_string())
    }
}

impl From<StagingError> for PipelineError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::NotFound(_)
            | StagingError::InvalidName(_)
            | StagingError::InvalidArchive { .. } => Self::Input(err.to_string()),
            StagingError::Io { .. } => Self::Transient(err.to_string()),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        Self::System(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbatch_core::{DomainError, JobId};

    #[test]
    fn classifies_component_errors() {
        assert!(matches!(
            PipelineError::from(ConvertError::input("corrupt")),
            PipelineError::Input(_)
        ));
        assert!(PipelineError::from(ConvertError::transient("oom")).is_retryable());
        assert!(matches!(
            PipelineError::from(StoreError::Unavailable("down".into())),
            PipelineError::System(_)
        ));
        assert!(matches!(
            PipelineError::from(StoreError::Domain(DomainError::invariant("x"))),
            PipelineError::System(_)
        ));
        assert!(matches!(
            PipelineError::from(QueueError::Poisoned),
            PipelineError::System(_)
        ));
        assert!(matches!(
            PipelineError::from(BundleError::Empty(JobId::new())),
            PipelineError::Finalization(_)
        ));
    }
}
