//! Single-delivery execution: the per-task state machine of a worker.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use docbatch_core::{FileStatus, FileTask, FileTaskUpdate, JobId};
use docbatch_events::{CompletionSignal, CompletionSink, Delivery, SignalError, TaskQueue};

use crate::conversion::ConverterRegistry;
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use crate::staging::StagingArea;
use crate::store::{JobStore, StoreError};

/// Why a delivery was acknowledged without running a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job or file task no longer exists.
    Missing,
    /// A previous delivery already resolved the task; its signal was re-sent.
    AlreadyTerminal,
    /// The message is older than the attempt recorded in the store.
    Stale,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    /// Transient failure; the next attempt is scheduled after `delay`.
    Retried { next_attempt: u32, delay: Duration },
    Skipped(SkipReason),
    /// Store, queue or finalization unavailable; the delivery comes back
    /// after a backoff.
    Requeued,
}

/// Everything a worker needs to execute deliveries.
#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    converters: Arc<ConverterRegistry>,
    sink: Arc<dyn CompletionSink>,
    retry: RetryPolicy,
    staging: Option<Arc<StagingArea>>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        converters: Arc<ConverterRegistry>,
        sink: Arc<dyn CompletionSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            converters,
            sink,
            retry,
            staging: None,
        }
    }

    /// Staging area whose job storage is released when a delivery finds
    /// its job deleted.
    pub fn with_staging(mut self, staging: Arc<StagingArea>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Execute one delivery and ack or nack it.
    ///
    /// Every state change is persisted before the completion signal is sent.
    pub fn execute(&self, delivery: &Delivery) -> TaskOutcome {
        let task = &delivery.task;

        let file = match self.store.find_file_task(task.job_id, &task.filename) {
            Ok(file) => file,
            Err(e) => return self.store_failure(delivery, e),
        };

        if file.is_terminal() {
            debug!(
                job_id = %task.job_id,
                file = %task.filename,
                status = %file.status,
                "task already resolved; re-sending completion"
            );
            return self.resolve(delivery, &file, TaskOutcome::Skipped(SkipReason::AlreadyTerminal));
        }

        if task.attempt < file.attempt {
            debug!(
                job_id = %task.job_id,
                file = %task.filename,
                attempt = task.attempt,
                stored_attempt = file.attempt,
                "stale delivery"
            );
            self.ack(delivery);
            return TaskOutcome::Skipped(SkipReason::Stale);
        }

        let file = match self
            .store
            .update_file_task_status(file.id, FileTaskUpdate::Processing { attempt: task.attempt })
        {
            Ok(file) => file,
            Err(e) => return self.store_failure(delivery, e),
        };

        debug!(
            job_id = %task.job_id,
            file = %task.filename,
            attempt = task.attempt,
            delivery = delivery.delivery_count,
            "converting"
        );

        let error = match self.converters.convert(task.kind, task.job_id, &task.filename) {
            Ok(output_ref) => {
                return self.settle(delivery, &file, FileTaskUpdate::Completed { output_ref });
            }
            Err(e) => e,
        };

        let classified = PipelineError::from(error.clone());
        if classified.is_retryable() && self.retry.should_retry(task.attempt) {
            return self.schedule_retry(delivery, &file, &error.to_string());
        }

        warn!(
            job_id = %task.job_id,
            file = %task.filename,
            attempt = task.attempt,
            error = %error,
            "conversion failed"
        );
        self.settle(
            delivery,
            &file,
            FileTaskUpdate::Failed {
                error_message: error.to_string(),
            },
        )
    }

    fn schedule_retry(&self, delivery: &Delivery, file: &FileTask, error: &str) -> TaskOutcome {
        let task = &delivery.task;
        let next = task.next_attempt();
        let delay = self.retry.delay_for_attempt(task.attempt);

        // The follow-up message goes out first: if this worker dies now, the
        // original delivery comes back and repeats the attempt.
        if let Err(e) = self.queue.enqueue_after(next.clone(), delay) {
            error!(job_id = %task.job_id, file = %task.filename, error = %e, "failed to schedule retry");
            return self.requeue(delivery);
        }

        match self.store.update_file_task_status(
            file.id,
            FileTaskUpdate::Retrying {
                attempt: next.attempt,
            },
        ) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return self.store_failure(delivery, e),
            // The retry message is already queued and carries the attempt.
            Err(e) => {
                debug!(job_id = %task.job_id, file = %task.filename, error = %e, "retry not recorded");
            }
        }

        info!(
            job_id = %task.job_id,
            file = %task.filename,
            attempt = task.attempt,
            next_attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "conversion failed; retrying"
        );
        self.ack(delivery);
        TaskOutcome::Retried {
            next_attempt: next.attempt,
            delay,
        }
    }

    /// Persist a terminal update, then signal and ack.
    fn settle(&self, delivery: &Delivery, file: &FileTask, update: FileTaskUpdate) -> TaskOutcome {
        match self.store.update_file_task_status(file.id, update) {
            Ok(resolved) => {
                let outcome = match resolved.status {
                    FileStatus::Completed => TaskOutcome::Completed,
                    _ => TaskOutcome::Failed,
                };
                self.resolve(delivery, &resolved, outcome)
            }
            // A concurrent delivery of the same task got there first.
            Err(StoreError::Domain(e)) => {
                debug!(job_id = %file.job_id, file = %file.name, error = %e, "terminal update refused");
                match self.store.find_file_task(file.job_id, &file.name) {
                    Ok(current) if current.is_terminal() => self.resolve(
                        delivery,
                        &current,
                        TaskOutcome::Skipped(SkipReason::AlreadyTerminal),
                    ),
                    Ok(_) => {
                        warn!(job_id = %file.job_id, file = %file.name, "task changed underneath delivery; dropping it");
                        self.ack(delivery);
                        TaskOutcome::Skipped(SkipReason::Stale)
                    }
                    Err(e) => self.store_failure(delivery, e),
                }
            }
            Err(e) => self.store_failure(delivery, e),
        }
    }

    fn store_failure(&self, delivery: &Delivery, err: StoreError) -> TaskOutcome {
        let task = &delivery.task;
        if err.is_not_found() {
            info!(job_id = %task.job_id, file = %task.filename, "job or file task gone; dropping delivery");
            // A conversion that outlived the job may have written output
            // after the job's storage was released.
            self.release_storage(task.job_id);
            self.ack(delivery);
            return TaskOutcome::Skipped(SkipReason::Missing);
        }
        if let StoreError::Domain(e) = &err {
            // A redelivery raced with another worker on the same attempt.
            debug!(job_id = %task.job_id, file = %task.filename, error = %e, "update refused; dropping delivery");
            self.ack(delivery);
            return TaskOutcome::Skipped(SkipReason::Stale);
        }
        error!(job_id = %task.job_id, file = %task.filename, error = %err, "job store unavailable; requeueing");
        self.requeue(delivery)
    }

    /// Signal a resolved task, then ack. A signal the sink could not act on
    /// is re-sent through a delayed redelivery.
    fn resolve(&self, delivery: &Delivery, file: &FileTask, outcome: TaskOutcome) -> TaskOutcome {
        if let Err(e) = self.signal(file) {
            warn!(job_id = %file.job_id, file = %file.name, error = %e, "completion not processed; redelivering");
            return self.requeue(delivery);
        }
        self.ack(delivery);
        outcome
    }

    /// Put the delivery back after a backoff, so workers do not spin on an
    /// outage.
    fn requeue(&self, delivery: &Delivery) -> TaskOutcome {
        let delay = self.retry.delay_for_attempt(delivery.delivery_count.max(1));
        match self.queue.enqueue_after(delivery.task.clone(), delay) {
            Ok(()) => self.ack(delivery),
            Err(e) => {
                warn!(tag = %delivery.tag, error = %e, delay_ms = delay.as_millis() as u64, "queue unavailable; backing off before nack");
                thread::sleep(delay);
                self.nack(delivery);
            }
        }
        TaskOutcome::Requeued
    }

    fn release_storage(&self, job_id: JobId) {
        if let Some(staging) = &self.staging {
            if let Err(e) = staging.cleanup(job_id) {
                warn!(job_id = %job_id, error = %e, "failed to release storage of deleted job");
            }
        }
    }

    fn signal(&self, file: &FileTask) -> Result<(), SignalError> {
        self.sink.report(CompletionSignal {
            job_id: file.job_id,
            file_task_id: file.id,
            status: file.status,
        })
    }

    fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery) {
            warn!(tag = %delivery.tag, error = %e, "ack failed; message may be redelivered");
        }
    }

    fn nack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.nack(delivery) {
            warn!(tag = %delivery.tag, error = %e, "nack failed; relying on redelivery");
        }
    }
}
