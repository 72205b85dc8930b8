use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use atelier_core::GenerationRequest;

use crate::error::GenerationError;

/// Finished content produced by the inference service.
///
/// The service uploads the bytes itself; the pipeline only stores the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub url: String,
}

/// A single request/response call to the inference service.
///
/// Implementations must bound how long `generate` may take. Exceeding the
/// bound is reported as [`GenerationError::Timeout`], like any other failure.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedContent, GenerationError>;

    /// Cheap liveness probe of the inference service.
    async fn health(&self) -> Result<(), GenerationError>;
}

#[async_trait]
impl<C> GenerationClient for Arc<C>
where
    C: GenerationClient + ?Sized,
{
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
        (**self).generate(request).await
    }

    async fn health(&self) -> Result<(), GenerationError> {
        (**self).health().await
    }
}
