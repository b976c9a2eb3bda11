//! Worker pool: N threads pulling task messages off the queue.
//!
//! Pool size is the only admission control. Each worker blocks on
//! `consume(poll_interval)`, so shutdown is observed within one poll
//! interval of being requested.

pub mod executor;

pub use executor::{SkipReason, TaskExecutor, TaskOutcome};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{PipelineError, PipelineResult};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    /// Thread name prefix, also used in logs.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            name: "docbatch-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct Counters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    requeued: AtomicU64,
    running: AtomicUsize,
    started: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    fn record(&self, outcome: &TaskOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            TaskOutcome::Completed => &self.completed,
            TaskOutcome::Failed => &self.failed,
            TaskOutcome::Retried { .. } => &self.retried,
            TaskOutcome::Skipped(_) => &self.skipped,
            TaskOutcome::Requeued => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }

    /// Stop pulling new tasks, let in-flight ones finish, join all threads.
    pub fn shutdown(self) -> WorkerStats {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins {
            if join.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
        let stats = self.counters.snapshot();
        info!(pool = %self.name, processed = stats.processed, "worker pool stopped");
        stats
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` threads sharing `executor`.
    pub fn spawn(executor: TaskExecutor, config: WorkerPoolConfig) -> PipelineResult<WorkerPoolHandle> {
        if config.workers == 0 {
            return Err(PipelineError::system("worker pool needs at least one worker"));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::new());
        let executor = Arc::new(executor);

        let mut joins = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker = Worker {
                name: format!("{}-{index}", config.name),
                executor: executor.clone(),
                shutdown: shutdown.clone(),
                counters: counters.clone(),
                poll_interval: config.poll_interval,
            };
            let spawned = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run());
            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    // Stop whatever already started before reporting.
                    shutdown.store(true, Ordering::SeqCst);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(PipelineError::system(format!("failed to spawn worker: {e}")));
                }
            }
        }

        info!(pool = %config.name, workers = config.workers, "worker pool started");
        Ok(WorkerPoolHandle {
            name: config.name,
            shutdown,
            joins,
            counters,
        })
    }
}

struct Worker {
    name: String,
    executor: Arc<TaskExecutor>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    poll_interval: Duration,
}

impl Worker {
    fn run(self) {
        debug!(worker = %self.name, "worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.executor.queue().consume(self.poll_interval) {
                Ok(Some(delivery)) => {
                    self.counters.running.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.executor.execute(&delivery);
                    self.counters.running.fetch_sub(1, Ordering::Relaxed);
                    self.counters.record(&outcome);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "failed to consume from queue");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        debug!(worker = %self.name, "worker stopped");
    }
}
