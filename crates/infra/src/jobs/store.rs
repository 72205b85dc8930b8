//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use atelier_core::{Job, JobId, JobStatus, OwnerRef, TransitionError};

/// Durable record of every generation job.
///
/// Both transitions only ever move a PENDING job to a terminal state. Calling
/// either on a terminal job returns [`JobStoreError::AlreadyTerminal`] and
/// leaves the record untouched.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new PENDING job for `owner`.
    async fn create(&self, owner: OwnerRef) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn mark_completed(&self, id: JobId, result_url: &str) -> Result<Job, JobStoreError>;

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Job, JobStoreError>;

    /// Remove a PENDING job whose task never reached the queue.
    ///
    /// Only the submission rollback path calls this.
    async fn revoke(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Jobs for one owning record, newest first.
    async fn list_for_owner(&self, owner: OwnerRef, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("transition rejected: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl From<TransitionError> for JobStoreError {
    fn from(value: TransitionError) -> Self {
        match value {
            TransitionError::AlreadyTerminal { id, status } => Self::AlreadyTerminal { id, status },
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.completed + self.failed
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed record (test fixtures).
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut Job) -> Result<(), TransitionError>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        // Work on a copy so a rejected transition cannot leave partial writes.
        let mut next = job.clone();
        apply(&mut next)?;
        *job = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, owner: OwnerRef) -> Result<Job, JobStoreError> {
        let job = Job::new(owner, Utc::now());
        self.insert(job.clone())?;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    async fn mark_completed(&self, id: JobId, result_url: &str) -> Result<Job, JobStoreError> {
        self.transition(id, |job| job.complete(result_url, Utc::now()))
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        self.transition(id, |job| job.fail(reason, Utc::now()))
    }

    async fn revoke(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get(&id) {
            None => Err(JobStoreError::NotFound(id)),
            Some(job) if job.is_terminal() => Err(JobStoreError::AlreadyTerminal {
                id,
                status: job.status,
            }),
            Some(_) => {
                jobs.remove(&id);
                Ok(())
            }
        }
    }

    async fn list_for_owner(&self, owner: OwnerRef, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs.values().filter(|j| j.owner == owner).cloned().collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();

        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

// Allow using Arc<InMemoryJobStore> / Arc<PostgresJobStore> / Arc<dyn JobStore> directly.
#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, owner: OwnerRef) -> Result<Job, JobStoreError> {
        (**self).create(owner).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn mark_completed(&self, id: JobId, result_url: &str) -> Result<Job, JobStoreError> {
        (**self).mark_completed(id, result_url).await
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        (**self).mark_failed(id, reason).await
    }

    async fn revoke(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).revoke(id).await
    }

    async fn list_for_owner(&self, owner: OwnerRef, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_for_owner(owner, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
