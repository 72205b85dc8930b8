//! Scripted in-process generation client for tests/dev.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use atelier_core::GenerationRequest;

use crate::client::{GeneratedContent, GenerationClient};
use crate::error::GenerationError;

/// Deterministic [`GenerationClient`].
///
/// - background requests yield `{base}/background/{profession}.png`
/// - shoot requests yield `{base}/shoot/{n}.png` where `n` is the call number
/// - product image URLs registered with [`fail_image`](Self::fail_image) fail
/// - every request is recorded
#[derive(Debug)]
pub struct FakeGenerationClient {
    base: String,
    delay: Option<Duration>,
    failing_images: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
    healthy: Mutex<bool>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl FakeGenerationClient {
    pub fn new() -> Self {
        Self {
            base: "https://generated.example".to_string(),
            delay: None,
            failing_images: Mutex::new(HashSet::new()),
            fail_all: Mutex::new(false),
            healthy: Mutex::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every call suspend for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_image(&self, product_image_url: impl Into<String>) {
        self.failing_images.lock().unwrap().insert(product_image_url.into());
    }

    pub fn fail_everything(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FakeGenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationClient for FakeGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
        let call_no = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if *self.fail_all.lock().unwrap() {
            return Err(GenerationError::Status {
                status: 500,
                body: "scripted failure".into(),
            });
        }

        match request {
            GenerationRequest::ProfileBackground(req) => Ok(GeneratedContent {
                url: format!(
                    "{}/background/{}.png",
                    self.base,
                    req.profession.to_lowercase().replace(' ', "-")
                ),
            }),
            GenerationRequest::ProfessionalShoot(req) => {
                if self.failing_images.lock().unwrap().contains(&req.product_image_url) {
                    return Err(GenerationError::Status {
                        status: 500,
                        body: format!("cannot shoot {}", req.product_image_url),
                    });
                }
                Ok(GeneratedContent {
                    url: format!("{}/shoot/{call_no}.png", self.base),
                })
            }
        }
    }

    async fn health(&self) -> Result<(), GenerationError> {
        if *self.healthy.lock().unwrap() {
            Ok(())
        } else {
            Err(GenerationError::Status {
                status: 503,
                body: "scripted outage".into(),
            })
        }
    }
}
