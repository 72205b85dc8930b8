//! Generation job record and its state machine.
//!
//! A job moves strictly `PENDING -> COMPLETED` or `PENDING -> FAILED`. Both
//! terminal states are final; every mutator below refuses to leave them.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DomainError, DomainResult};
use crate::id::{ArtistId, JobId, ProductMediaId};

/// Type of marketplace record a job augments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerKind {
    ProfileBackground,
    ProductImage,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfileBackground => "PROFILE_BACKGROUND",
            Self::ProductImage => "PRODUCT_IMAGE",
        }
    }
}

impl core::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerKind {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        match s {
            "PROFILE_BACKGROUND" => Ok(Self::ProfileBackground),
            "PRODUCT_IMAGE" => Ok(Self::ProductImage),
            other => Err(DomainError::validation(format!("unknown owner kind: {other}"))),
        }
    }
}

/// The specific marketplace record a job writes its result onto.
///
/// The kind is carried by the variant, so kind and reference cannot disagree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerRef {
    ProfileBackground { artist_id: ArtistId },
    ProductImage { product_media_id: ProductMediaId },
}

impl OwnerRef {
    pub fn profile_background(artist_id: ArtistId) -> Self {
        Self::ProfileBackground { artist_id }
    }

    pub fn product_image(product_media_id: ProductMediaId) -> Self {
        Self::ProductImage { product_media_id }
    }

    pub fn kind(&self) -> OwnerKind {
        match self {
            Self::ProfileBackground { .. } => OwnerKind::ProfileBackground,
            Self::ProductImage { .. } => OwnerKind::ProductImage,
        }
    }

    /// Raw key of the owning record, as stored next to the kind.
    pub fn id(&self) -> i64 {
        match self {
            Self::ProfileBackground { artist_id } => artist_id.get(),
            Self::ProductImage { product_media_id } => product_media_id.get(),
        }
    }

    pub fn from_parts(kind: OwnerKind, id: i64) -> Self {
        match kind {
            OwnerKind::ProfileBackground => Self::profile_background(ArtistId::new(id)),
            OwnerKind::ProductImage => Self::product_image(ProductMediaId::new(id)),
        }
    }
}

impl core::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Rejected status transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    #[error("result url must not be empty")]
    EmptyResultUrl,
}

/// Persisted record of one unit of asynchronous generation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerRef,
    pub status: JobStatus,
    pub result_url: Option<String>,
    /// Diagnostic reason recorded on FAILED; never drives behavior.
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(owner: OwnerRef, now: DateTime<Utc>) -> Self {
        Self::with_id(JobId::new(), owner, now)
    }

    pub fn with_id(id: JobId, owner: OwnerRef, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner,
            status: JobStatus::Pending,
            result_url: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner_kind(&self) -> OwnerKind {
        self.owner.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition `PENDING -> COMPLETED` with the generated content URL.
    pub fn complete(
        &mut self,
        result_url: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_pending()?;
        let result_url = result_url.into();
        if result_url.trim().is_empty() {
            return Err(TransitionError::EmptyResultUrl);
        }
        self.status = JobStatus::Completed;
        self.result_url = Some(result_url);
        self.updated_at = at;
        Ok(())
    }

    /// Transition `PENDING -> FAILED`.
    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_pending()?;
        self.status = JobStatus::Failed;
        self.failure = Some(reason.into());
        self.updated_at = at;
        Ok(())
    }

    /// Check the record-level invariants. Used when loading rows from storage.
    pub fn validate(&self) -> DomainResult<()> {
        match (self.status, &self.result_url) {
            (JobStatus::Completed, None) => {
                return Err(DomainError::invariant(format!(
                    "job {} is COMPLETED without a result url",
                    self.id
                )));
            }
            (JobStatus::Pending | JobStatus::Failed, Some(_)) => {
                return Err(DomainError::invariant(format!(
                    "job {} is {} but carries a result url",
                    self.id, self.status
                )));
            }
            _ => {}
        }
        if self.failure.is_some() && self.status != JobStatus::Failed {
            return Err(DomainError::invariant(format!(
                "job {} is {} but carries a failure reason",
                self.id, self.status
            )));
        }
        if self.updated_at < self.created_at {
            return Err(DomainError::invariant(format!(
                "job {} was updated before it was created",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }
}
