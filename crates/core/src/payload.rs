//! Structured inputs sent to the inference service.

use serde::{Deserialize, Serialize};

use crate::job::OwnerKind;

/// Text prompt for a profile background poster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundRequest {
    pub profession: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_request: Option<String>,
}

/// Re-shoot of one product photo in a studio style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfessionalShootRequest {
    pub art_form: String,
    pub product_image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_description: Option<String>,
}

/// Payload carried by a queued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationRequest {
    ProfileBackground(BackgroundRequest),
    ProfessionalShoot(ProfessionalShootRequest),
}

impl GenerationRequest {
    /// Owner kind this payload is allowed to write onto.
    pub fn owner_kind(&self) -> OwnerKind {
        match self {
            Self::ProfileBackground(_) => OwnerKind::ProfileBackground,
            Self::ProfessionalShoot(_) => OwnerKind::ProductImage,
        }
    }
}
