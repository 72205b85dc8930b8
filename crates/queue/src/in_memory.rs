//! In-memory task queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::{QueueError, TaskQueue};
use crate::task::{Delivery, Task, TaskHandle};

/// Default lease length before an unacked task may be redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Lease {
    task: Task,
    delivery_count: u32,
    consumer: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    ready: VecDeque<(TaskHandle, Task)>,
    in_flight: HashMap<TaskHandle, Lease>,
}

/// In-memory at-least-once queue.
///
/// - FIFO ready list plus a lease table for delivered tasks
/// - expired leases are redelivered before new work
/// - not durable: everything is lost with the process
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Tasks waiting for their first delivery.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// Tasks delivered but not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Try to lease one task without waiting.
    ///
    /// Returns the delivery, or the earliest lease expiry to wait for.
    fn try_lease(&self, consumer: &str) -> Result<Delivery, Option<Instant>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let expired = state
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .min_by_key(|(_, lease)| lease.expires_at)
            .map(|(handle, _)| handle.clone());

        if let Some(handle) = expired {
            if let Some(lease) = state.in_flight.get_mut(&handle) {
                tracing::debug!(
                    handle = %handle,
                    job_id = %lease.task.job_id,
                    previous_consumer = %lease.consumer,
                    consumer = %consumer,
                    "reclaiming expired lease"
                );
                lease.delivery_count += 1;
                lease.consumer = consumer.to_string();
                lease.expires_at = now + self.visibility_timeout;
                return Ok(Delivery {
                    handle,
                    task: lease.task.clone(),
                    delivery_count: lease.delivery_count,
                });
            }
        }

        if let Some((handle, task)) = state.ready.pop_front() {
            state.in_flight.insert(
                handle.clone(),
                Lease {
                    task: task.clone(),
                    delivery_count: 1,
                    consumer: consumer.to_string(),
                    expires_at: now + self.visibility_timeout,
                },
            );
            return Ok(Delivery {
                handle,
                task,
                delivery_count: 1,
            });
        }

        Err(state.in_flight.values().map(|lease| lease.expires_at).min())
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<TaskHandle, QueueError> {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.next_seq += 1;
            let handle = TaskHandle::new(format!("mem-{}", state.next_seq));
            state.ready.push_back((handle.clone(), task.clone()));
            handle
        };
        self.notify.notify_one();
        Ok(handle)
    }

    async fn dequeue(&self, consumer: &str) -> Result<Delivery, QueueError> {
        loop {
            // Register interest before checking so an enqueue between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_lease(consumer) {
                Ok(delivery) => return Ok(delivery),
                Err(Some(next_expiry)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(next_expiry) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.remove(&delivery.handle).is_none() {
            tracing::debug!(handle = %delivery.handle, "ack for unknown handle ignored");
        }
        Ok(())
    }
}
