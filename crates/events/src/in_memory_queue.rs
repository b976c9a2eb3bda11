//! In-memory task queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::message::TaskMessage;
use crate::queue::{Delivery, DeliveryTag, QueueError, TaskQueue};

#[derive(Debug, Clone)]
struct Queued {
    task: TaskMessage,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Queued>,
    delayed: Vec<(Instant, Queued)>,
    in_flight: HashMap<DeliveryTag, Queued>,
    next_tag: u64,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(at, _)| *at);
        while self.delayed.first().is_some_and(|(at, _)| *at <= now) {
            let (_, queued) = self.delayed.remove(0);
            self.ready.push_back(queued);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-memory FIFO work queue.
///
/// - No IO, no persistence: a process crash loses everything
/// - One consumer per delivery; unacked deliveries stay in flight until
///   acked, nacked or [`redeliver_in_flight`](Self::redeliver_in_flight)
/// - Delayed messages are promoted lazily by consumers
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages ready or waiting on a delay (excluding in-flight ones).
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.ready.len() + s.delayed.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Put every unacked delivery back at the head of the queue, as a broker
    /// does when consumers die without acking.
    pub fn redeliver_in_flight(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        let mut stranded: Vec<_> = state.in_flight.drain().collect();
        stranded.sort_by(|(a, _), (b, _)| a.0.cmp(&b.0));
        let count = stranded.len();
        if count > 0 {
            tracing::debug!(count, "redelivering unacked messages");
        }
        for (_, queued) in stranded.into_iter().rev() {
            state.ready.push_front(queued);
        }
        drop(state);
        self.available.notify_all();
        Ok(count)
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        state.ready.push_back(Queued {
            task,
            deliveries: 0,
        });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn enqueue_after(&self, task: TaskMessage, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(task);
        }
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        state.delayed.push((
            Instant::now() + delay,
            Queued {
                task,
                deliveries: 0,
            },
        ));
        drop(state);
        // Wake sleepers so they shorten their wait to the new due time.
        self.available.notify_all();
        Ok(())
    }

    fn consume(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;

        loop {
            let now = Instant::now();
            state.promote_due(now);

            if let Some(mut queued) = state.ready.pop_front() {
                queued.deliveries += 1;
                state.next_tag += 1;
                let tag = DeliveryTag(format!("mem-{:020}", state.next_tag));
                let delivery = Delivery {
                    tag: tag.clone(),
                    task: queued.task.clone(),
                    delivery_count: queued.deliveries,
                };
                state.in_flight.insert(tag, queued);
                return Ok(Some(delivery));
            }

            if now >= deadline {
                return Ok(None);
            }

            let mut wait = deadline - now;
            if let Some(due) = state.next_due() {
                wait = wait.min(due.saturating_duration_since(now));
            }

            let (guard, _) = self
                .available
                .wait_timeout(state, wait)
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        state
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.tag.clone()))
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        let queued = state
            .in_flight
            .remove(&delivery.tag)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.tag.clone()))?;
        state.ready.push_back(queued);
        drop(state);
        self.available.notify_one();
        Ok(())
    }
}
