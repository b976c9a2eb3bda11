//! Pipeline wiring: store, queue, staging, converters, coordinator, the
//! worker pool and the sweeper, assembled from a [`PipelineConfig`].
//!
//! - `DATABASE_URL` set: Postgres job store, driven by a runtime the
//!   pipeline owns; otherwise the in-memory store.
//! - `REDIS_URL` set: Redis Streams queue (`redis` feature); otherwise the
//!   in-memory queue.

use std::sync::Arc;

use tracing::info;

use docbatch_events::{InMemoryTaskQueue, TaskQueue};

use crate::bundle::ZipBundler;
use crate::config::PipelineConfig;
use crate::conversion::ConverterRegistry;
use crate::coordinator::{Coordinator, Sweeper, SweeperHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::finalizer::Finalizer;
use crate::staging::StagingArea;
use crate::store::{InMemoryJobStore, JobStore, PostgresJobStore};
use crate::worker::{TaskExecutor, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};

/// Builder for a running [`Pipeline`].
///
/// Backends default to what the config selects; tests swap in their own.
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn JobStore>>,
    queue: Option<Arc<dyn TaskQueue>>,
    converters: Option<ConverterRegistry>,
}

impl PipelineBuilder {
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_converters(mut self, converters: ConverterRegistry) -> Self {
        self.converters = Some(converters);
        self
    }

    /// Open the backends, recover in-progress jobs, then start the workers
    /// and the sweeper.
    pub fn start(self) -> PipelineResult<Pipeline> {
        let sweep_interval = self.config.sweep_interval;
        let mut pipeline = self.open()?;
        pipeline.coordinator.recover()?;

        let converters = pipeline
            .converters
            .take()
            .unwrap_or_else(|| ConverterRegistry::with_defaults(pipeline.staging.clone()));
        let executor = TaskExecutor::new(
            pipeline.store.clone(),
            pipeline.queue.clone(),
            Arc::new(converters),
            pipeline.coordinator.clone(),
            pipeline.config.retry.clone(),
        )
        .with_staging(pipeline.staging.clone());
        pipeline.workers = Some(WorkerPool::spawn(
            executor,
            WorkerPoolConfig::default()
                .with_workers(pipeline.config.workers)
                .with_poll_interval(pipeline.config.poll_interval),
        )?);
        pipeline.sweeper = Some(Sweeper::spawn(pipeline.coordinator.clone(), sweep_interval)?);

        info!(
            storage_path = %pipeline.config.storage_path.display(),
            workers = pipeline.config.workers,
            "pipeline started"
        );
        Ok(pipeline)
    }

    /// Open the backends without recovering jobs or starting workers.
    ///
    /// For short-lived processes that inspect or delete jobs while another
    /// process runs the workers.
    pub fn open(self) -> PipelineResult<Pipeline> {
        let config = self.config;
        config.validate()?;

        let staging = Arc::new(StagingArea::open(&config.storage_path)?);

        let mut runtime = None;
        let store: Arc<dyn JobStore> = match (self.store, &config.database_url) {
            (Some(store), _) => store,
            (None, Some(url)) => {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("docbatch-store")
                    .enable_all()
                    .build()
                    .map_err(|e| PipelineError::system(format!("failed to start store runtime: {e}")))?;
                let store = PostgresJobStore::connect(url, rt.handle().clone())?;
                runtime = Some(rt);
                Arc::new(store)
            }
            (None, None) => InMemoryJobStore::arc(),
        };

        let queue = match self.queue {
            Some(queue) => queue,
            None => open_queue(&config)?,
        };

        let finalizer = Finalizer::new(store.clone(), Arc::new(ZipBundler::new(staging.clone())))
            .with_staging(staging.clone())
            .with_lease(config.finalize_lease);
        let coordinator = Arc::new(
            Coordinator::new(store.clone(), queue.clone(), finalizer).with_staging(staging.clone()),
        );

        Ok(Pipeline {
            config,
            coordinator,
            staging,
            store,
            queue,
            converters: self.converters,
            workers: None,
            sweeper: None,
            _runtime: runtime,
        })
    }
}

/// A pipeline, running or merely opened. Submit and inspect jobs through
/// [`Pipeline::coordinator`].
pub struct Pipeline {
    config: PipelineConfig,
    coordinator: Arc<Coordinator>,
    staging: Arc<StagingArea>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    converters: Option<ConverterRegistry>,
    workers: Option<WorkerPoolHandle>,
    sweeper: Option<SweeperHandle>,
    // Drives the Postgres store; dropped after the workers stop.
    _runtime: Option<tokio::runtime::Runtime>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            store: None,
            queue: None,
            converters: None,
        }
    }

    /// Start with the backends `config` selects.
    pub fn start(config: PipelineConfig) -> PipelineResult<Self> {
        Self::builder(config).start()
    }

    /// Open the backends `config` selects; no workers run.
    pub fn open(config: PipelineConfig) -> PipelineResult<Self> {
        Self::builder(config).open()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn staging(&self) -> &Arc<StagingArea> {
        &self.staging
    }

    pub fn stats(&self) -> WorkerStats {
        self.workers
            .as_ref()
            .map(WorkerPoolHandle::stats)
            .unwrap_or_default()
    }

    /// Stop the sweeper, then the workers after their in-flight tasks.
    /// Queued tasks stay queued for the next start.
    pub fn shutdown(self) -> WorkerStats {
        if let Some(sweeper) = self.sweeper {
            sweeper.shutdown();
        }
        let stats = self
            .workers
            .map(WorkerPoolHandle::shutdown)
            .unwrap_or_default();
        info!(processed = stats.processed, "pipeline stopped");
        stats
    }
}

fn open_queue(config: &PipelineConfig) -> PipelineResult<Arc<dyn TaskQueue>> {
    match &config.redis_url {
        None => Ok(Arc::new(InMemoryTaskQueue::new())),
        #[cfg(feature = "redis")]
        Some(url) => {
            let consumer = format!("docbatch-{}", std::process::id());
            let queue = crate::queue::RedisStreamsTaskQueue::new(url, consumer)?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(PipelineError::system(
            "REDIS_URL is set but this build lacks the `redis` feature",
        )),
    }
}
