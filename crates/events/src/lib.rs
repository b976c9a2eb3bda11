//! Task messages, completion signals and the work queue contract.

pub mod in_memory_queue;
pub mod message;
pub mod queue;

pub use in_memory_queue::InMemoryTaskQueue;
pub use message::{CompletionSignal, CompletionSink, SignalError, TaskMessage};
pub use queue::{Delivery, DeliveryTag, QueueError, TaskQueue};
