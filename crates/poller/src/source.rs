//! Where job status comes from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use atelier_core::{JobId, JobStatus};

use crate::error::PollError;

/// The part of a job view the poller cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
}

/// One status lookup. `Ok(None)` means the id is unknown to the server.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, id: JobId) -> Result<Option<JobSnapshot>, PollError>;
}

#[async_trait]
impl<S> StatusSource for Arc<S>
where
    S: StatusSource + ?Sized,
{
    async fn fetch(&self, id: JobId) -> Result<Option<JobSnapshot>, PollError> {
        (**self).fetch(id).await
    }
}

/// Reads `GET {base}/jobs/{id}` from the pipeline's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpStatusSource {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(PollError::request)?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { client, base_url }
    }

    fn job_url(&self, id: JobId) -> Result<Url, PollError> {
        self.base_url
            .join(&format!("jobs/{id}"))
            .map_err(|e| PollError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn fetch(&self, id: JobId) -> Result<Option<JobSnapshot>, PollError> {
        let response = self
            .client
            .get(self.job_url(id)?)
            .send()
            .await
            .map_err(PollError::request)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PollError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<JobSnapshot>()
            .await
            .map(Some)
            .map_err(|e| PollError::Decode(e.to_string()))
    }
}
