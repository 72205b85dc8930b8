//! HTTP client for the inference service.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | `POST` | `api/profile-manage/get-profile-background` | `{background_url}` |
//! | `POST` | `api/product-manage/generate-professional-shoot` | `{generated_product_image_url}` |
//! | `GET` | `health` | any 2xx |

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use atelier_core::GenerationRequest;

use crate::client::{GeneratedContent, GenerationClient};
use crate::error::GenerationError;

const BACKGROUND_PATH: &str = "api/profile-manage/get-profile-background";
const SHOOT_PATH: &str = "api/product-manage/generate-professional-shoot";
const HEALTH_PATH: &str = "health";

#[derive(Debug, Deserialize)]
struct BackgroundResponse {
    background_url: String,
}

#[derive(Debug, Deserialize)]
struct ShootResponse {
    generated_product_image_url: String,
}

/// reqwest-backed [`GenerationClient`].
#[derive(Debug, Clone)]
pub struct HttpGenerationClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpGenerationClient {
    /// * `base_url` - service root, e.g. `http://ml:8000/`.
    /// * `timeout` - upper bound for one whole request/response exchange.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Config(e.to_string()))?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, mut base_url: Url, timeout: Duration) -> Self {
        // `Url::join` drops the last segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            client,
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, GenerationError> {
        self.base_url
            .join(path)
            .map_err(|e| GenerationError::Config(format!("{path}: {e}")))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, GenerationError>
    where
        B: serde::Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let exchange = async {
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| self.map_reqwest_error(e))?;
            let response = Self::ensure_success(response).await?;
            let bytes = response.bytes().await.map_err(|e| self.map_reqwest_error(e))?;
            serde_json::from_slice::<T>(&bytes)
                .map_err(|e| GenerationError::MalformedResponse(e.to_string()))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout))?
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::Request(err.to_string())
        }
    }
}

/// Reject empty or unparsable content URLs.
fn validate_url(raw: String) -> Result<GeneratedContent, GenerationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::MalformedResponse("empty content url".into()));
    }
    Url::parse(trimmed).map_err(|e| GenerationError::InvalidUrl(format!("{trimmed}: {e}")))?;
    Ok(GeneratedContent {
        url: trimmed.to_string(),
    })
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    #[instrument(skip(self, request), fields(kind = %request.owner_kind()), err)]
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
        let url = match request {
            GenerationRequest::ProfileBackground(body) => {
                self.post_json::<_, BackgroundResponse>(BACKGROUND_PATH, body)
                    .await?
                    .background_url
            }
            GenerationRequest::ProfessionalShoot(body) => {
                self.post_json::<_, ShootResponse>(SHOOT_PATH, body)
                    .await?
                    .generated_product_image_url
            }
        };
        validate_url(url)
    }

    async fn health(&self) -> Result<(), GenerationError> {
        let url = self.endpoint(HEALTH_PATH)?;
        let probe = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| self.map_reqwest_error(e))?;
            Self::ensure_success(response).await.map(|_| ())
        };
        tokio::time::timeout(self.timeout, probe)
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout))?
    }
}
