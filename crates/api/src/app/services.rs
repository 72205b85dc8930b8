use std::sync::Arc;

use atelier_generation::GenerationClient;
use atelier_infra::pipeline::{Pipeline, Producer, StatusService};

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppServices {
    pub producer: Producer,
    pub status: StatusService,
    pub generation: Arc<dyn GenerationClient>,
}

impl AppServices {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            producer: pipeline.producer(),
            status: pipeline.status(),
            generation: pipeline.generation.clone(),
        }
    }
}
