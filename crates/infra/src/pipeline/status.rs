//! Read-only job status lookups for polling clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{Job, JobId, JobStatus, OwnerKind, OwnerRef};

use crate::jobs::{JobStats, JobStore, JobStoreError};

/// Largest id list one summary request may ask about.
pub const MAX_SUMMARY_IDS: usize = 500;

/// Client-facing projection of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub owner_kind: OwnerKind,
    pub owner_ref: i64,
    pub status: JobStatus,
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            owner_kind: job.owner.kind(),
            owner_ref: job.owner.id(),
            status: job.status,
            result_url: job.result_url,
            failure: job.failure,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Explicit per-status counts for a set of jobs.
///
/// A job that is not FAILED is not therefore COMPLETED: callers must check
/// `completed` (or [`all_completed`](Self::all_completed)) directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    /// Ids the store has no record of.
    pub missing: usize,
}

impl BatchSummary {
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }

    /// No job is still running and every id was found.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.missing == 0
    }

    fn count(&mut self, status: Option<JobStatus>) {
        self.total += 1;
        match status {
            Some(JobStatus::Pending) => self.pending += 1,
            Some(JobStatus::Completed) => self.completed += 1,
            Some(JobStatus::Failed) => self.failed += 1,
            None => self.missing += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("too many job ids: {requested} (max {max})")]
    TooManyIds { requested: usize, max: usize },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for StatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusService").finish_non_exhaustive()
    }
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobView, StatusError> {
        self.store
            .get(id)
            .await?
            .map(JobView::from)
            .ok_or(StatusError::NotFound(id))
    }

    pub async fn list_for_owner(&self, owner: OwnerRef, limit: usize) -> Result<Vec<JobView>, StatusError> {
        Ok(self
            .store
            .list_for_owner(owner, limit)
            .await?
            .into_iter()
            .map(JobView::from)
            .collect())
    }

    pub async fn summarize(&self, ids: &[JobId]) -> Result<BatchSummary, StatusError> {
        if ids.len() > MAX_SUMMARY_IDS {
            return Err(StatusError::TooManyIds {
                requested: ids.len(),
                max: MAX_SUMMARY_IDS,
            });
        }
        let mut summary = BatchSummary::default();
        for id in ids {
            let status = self.store.get(*id).await?.map(|job| job.status);
            summary.count(status);
        }
        Ok(summary)
    }

    pub async fn stats(&self) -> Result<JobStats, StatusError> {
        Ok(self.store.stats().await?)
    }
}
