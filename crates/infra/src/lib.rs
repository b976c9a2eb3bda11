//! Batch conversion orchestration.
//!
//! Storage, queue backends, the staging area, converters, the worker pool
//! and the coordinator/finalizer pair that turns a batch of file tasks into
//! one job outcome.

pub mod bundle;
pub mod config;
pub mod conversion;
pub mod coordinator;
pub mod error;
pub mod finalizer;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod staging;
pub mod store;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use bundle::{ResultBundler, ZipBundler};
pub use config::{ConfigError, PipelineConfig};
pub use conversion::{ConvertError, Converter, ConverterRegistry, OutputRef};
pub use coordinator::{Coordinator, Recovery, Sweeper, SweeperHandle};
pub use error::{PipelineError, PipelineResult};
pub use finalizer::{Finalization, Finalizer, DEFAULT_FINALIZE_LEASE};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use staging::{StagingArea, StagingError};
pub use store::{FinalizeClaim, InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
pub use worker::{TaskExecutor, WorkerPool, WorkerPoolConfig, WorkerStats};
