//! Queue abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{Delivery, Task, TaskHandle};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The backing transport could not be reached.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The transport rejected a command.
    #[error("queue command failed: {0}")]
    Command(String),

    #[error("task serialization failed: {0}")]
    Serialization(String),

    #[error("task deserialization failed: {0}")]
    Deserialization(String),
}

/// Durable, at-least-once task channel.
///
/// ## Delivery Guarantees
///
/// - A delivered task stays leased to its consumer until [`TaskQueue::ack`] is
///   called. If the lease outlives the visibility timeout, the task becomes
///   eligible for redelivery to any consumer.
/// - Order is FIFO where the transport makes it cheap; nothing depends on it.
/// - Durable implementations keep both queued and leased tasks across a
///   process restart.
///
/// ## Cancellation
///
/// `dequeue` suspends until a task is available. Dropping the future before it
/// resolves must not lose a task, so callers can race it against a shutdown
/// signal.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &Task) -> Result<TaskHandle, QueueError>;

    async fn dequeue(&self, consumer: &str) -> Result<Delivery, QueueError>;

    /// Acknowledge a delivery. Acking an unknown or already-acked handle is a no-op.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    async fn enqueue(&self, task: &Task) -> Result<TaskHandle, QueueError> {
        (**self).enqueue(task).await
    }

    async fn dequeue(&self, consumer: &str) -> Result<Delivery, QueueError> {
        (**self).dequeue(consumer).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }
}
