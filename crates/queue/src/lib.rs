//! `atelier-queue` — task channel between the producer and the worker pool.
//!
//! The queue is the **transport layer** for generation work. The job store is
//! the source of truth for what happened; the queue only guarantees that every
//! enqueued task is delivered at least once.
//!
//! ```text
//! Producer → JobStore (create PENDING) → TaskQueue (enqueue) → Worker Pool
//! ```
//!
//! Consumers must be idempotent. A task may be redelivered after its
//! visibility timeout if the consumer that held it never acknowledged it.

pub mod in_memory;
pub mod queue;
pub mod task;

pub use in_memory::InMemoryTaskQueue;
pub use queue::{QueueError, TaskQueue};
pub use task::{Delivery, Task, TaskHandle};
