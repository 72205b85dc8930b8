//! Submission path: create a PENDING job per unit of work and enqueue its task.
//!
//! The producer never waits on generation. It returns as soon as every unit is
//! both recorded in the job store and present on the queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use atelier_core::{
    ArtistId, BackgroundRequest, GenerationRequest, JobId, JobStatus, OwnerKind, OwnerRef, ProductId,
    ProfessionalShootRequest,
};
use atelier_queue::{QueueError, Task, TaskQueue};

use crate::jobs::{JobStore, JobStoreError};
use crate::marketplace::{MarketplaceError, MarketplaceStore};

/// Optional overrides sent with a background request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundParams {
    #[serde(default)]
    pub background_text: Option<String>,
    #[serde(default)]
    pub experience_text: Option<String>,
    #[serde(default)]
    pub custom_req_text: Option<String>,
}

/// One accepted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub owner: OwnerRef,
    pub status: JobStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{kind} owner {id} not found")]
    OwnerNotFound { kind: OwnerKind, id: i64 },

    #[error("product {0} has no media to generate from")]
    NothingToGenerate(ProductId),

    #[error("job store unavailable: {0}")]
    Store(#[from] JobStoreError),

    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("marketplace lookup failed: {0}")]
    Marketplace(#[from] MarketplaceError),

    /// Some units were accepted before a later unit failed.
    #[error("submitted {} job(s) before failing: {source}", .submitted.len())]
    Partial {
        submitted: Vec<SubmittedJob>,
        #[source]
        source: Box<SubmitError>,
    },
}

impl SubmitError {
    /// Jobs that are live despite the error.
    pub fn submitted(&self) -> &[SubmittedJob] {
        match self {
            Self::Partial { submitted, .. } => submitted,
            _ => &[],
        }
    }
}

#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    marketplace: Arc<dyn MarketplaceStore>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

impl Producer {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        marketplace: Arc<dyn MarketplaceStore>,
    ) -> Self {
        Self {
            store,
            queue,
            marketplace,
        }
    }

    /// Queue one background poster for an artist.
    #[instrument(skip(self, params), fields(artist_id = %artist_id))]
    pub async fn submit_background(
        &self,
        artist_id: ArtistId,
        params: BackgroundParams,
    ) -> Result<Vec<SubmittedJob>, SubmitError> {
        let profile = self
            .marketplace
            .profile_context(artist_id)
            .await?
            .ok_or(SubmitError::OwnerNotFound {
                kind: OwnerKind::ProfileBackground,
                id: artist_id.get(),
            })?;

        let active = profile.active_description;
        let request = BackgroundRequest {
            profession: profile.profession,
            location: active
                .as_ref()
                .and_then(|d| d.location.clone())
                .unwrap_or_default(),
            background: params
                .background_text
                .or_else(|| active.as_ref().and_then(|d| d.background_info.clone())),
            experience: params
                .experience_text
                .or_else(|| active.as_ref().and_then(|d| d.experience.clone())),
            description: active.as_ref().map(|d| d.text.clone()),
            custom_request: params.custom_req_text,
        };

        let owner = OwnerRef::profile_background(artist_id);
        let job = self
            .submit_unit(owner, GenerationRequest::ProfileBackground(request))
            .await?;
        Ok(vec![job])
    }

    /// Queue one professional shoot per product photo.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn submit_professional_shoot(&self, product_id: ProductId) -> Result<Vec<SubmittedJob>, SubmitError> {
        let product = self
            .marketplace
            .product_shoot_context(product_id)
            .await?
            .ok_or(SubmitError::OwnerNotFound {
                kind: OwnerKind::ProductImage,
                id: product_id.get(),
            })?;

        if product.media.is_empty() {
            return Err(SubmitError::NothingToGenerate(product_id));
        }

        let mut submitted = Vec::with_capacity(product.media.len());
        for media in &product.media {
            let request = GenerationRequest::ProfessionalShoot(ProfessionalShootRequest {
                art_form: product.art_form.clone(),
                product_image_url: media.image_url.clone(),
                product_description: product.product_description.clone(),
            });

            match self.submit_unit(OwnerRef::product_image(media.id), request).await {
                Ok(job) => submitted.push(job),
                Err(e) if submitted.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        submitted = submitted.len(),
                        total = product.media.len(),
                        error = %e,
                        "professional shoot partially submitted"
                    );
                    return Err(SubmitError::Partial {
                        submitted,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(jobs = submitted.len(), "professional shoot submitted");
        Ok(submitted)
    }

    /// Create the job, then enqueue its task. Revokes the job if the enqueue fails.
    pub async fn submit_unit(&self, owner: OwnerRef, payload: GenerationRequest) -> Result<SubmittedJob, SubmitError> {
        let job = self.store.create(owner).await?;
        let task = Task::new(job.id, owner, payload);

        match self.queue.enqueue(&task).await {
            Ok(handle) => {
                info!(job_id = %job.id, owner = %owner, handle = %handle, "job submitted");
                Ok(SubmittedJob {
                    job_id: job.id,
                    owner,
                    status: job.status,
                })
            }
            Err(queue_err) => {
                if let Err(revoke_err) = self.store.revoke(job.id).await {
                    error!(
                        job_id = %job.id,
                        owner = %owner,
                        queue_error = %queue_err,
                        revoke_error = %revoke_err,
                        "enqueue failed and job could not be revoked; job has no task"
                    );
                } else {
                    warn!(job_id = %job.id, error = %queue_err, "enqueue failed, job revoked");
                }
                Err(SubmitError::Queue(queue_err))
            }
        }
    }
}
