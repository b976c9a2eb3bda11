//! Work queue abstraction (mechanics only).
//!
//! The queue hands each task message to **one** consumer at a time, unlike a
//! broadcast bus. Delivery is **at-least-once**:
//!
//! - a delivery that is neither acked nor nacked is eventually redelivered
//!   (crash, lost connection, visibility timeout);
//! - `nack` puts a message straight back for redelivery;
//! - consumers must therefore be idempotent.
//!
//! Retries with backoff go through [`TaskQueue::enqueue_after`], which
//! publishes a *new* message; the original delivery is acked.

use std::time::Duration;

use crate::message::TaskMessage;

/// Opaque transport handle for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer, pending `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub task: TaskMessage,
    /// How many times the transport has delivered this message (1 = first).
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Broker unreachable or refused the command.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),

    /// `ack`/`nack` for a delivery the queue does not hold in flight.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(DeliveryTag),

    /// Internal lock poisoning (in-memory implementations).
    #[error("queue state poisoned")]
    Poisoned,
}

/// Durable, competing-consumer task queue.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError>;

    /// Make `task` visible to consumers only after `delay`.
    fn enqueue_after(&self, task: TaskMessage, delay: Duration) -> Result<(), QueueError>;

    /// Block up to `timeout` for the next message.
    fn consume(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return the message for redelivery.
    fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

impl<Q> TaskQueue for std::sync::Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError> {
        (**self).enqueue(task)
    }

    fn enqueue_after(&self, task: TaskMessage, delay: Duration) -> Result<(), QueueError> {
        (**self).enqueue_after(task, delay)
    }

    fn consume(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).consume(timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery)
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).nack(delivery)
    }
}
