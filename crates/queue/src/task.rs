//! Task wire types.

use serde::{Deserialize, Serialize};

use atelier_core::{GenerationRequest, JobId, OwnerRef};

use crate::queue::QueueError;

/// Message that travels through the queue.
///
/// It references exactly one job and carries that job's input. Delivering the
/// same task twice is safe: the worker checks the job's status first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub job_id: JobId,
    pub owner: OwnerRef,
    pub payload: GenerationRequest,
}

impl Task {
    pub fn new(job_id: JobId, owner: OwnerRef, payload: GenerationRequest) -> Self {
        Self {
            job_id,
            owner,
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        serde_json::from_str(raw).map_err(|e| QueueError::Deserialization(e.to_string()))
    }
}

/// Opaque, transport-assigned identifier of an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task leased to one consumer until it is acknowledged or its visibility
/// timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub handle: TaskHandle,
    pub task: Task,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
