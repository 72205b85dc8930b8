//! Owning-entity access.
//!
//! The marketplace tables belong to the surrounding application. The pipeline
//! reads the few columns it needs to build generation prompts and writes one
//! result column per owner kind.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use atelier_core::{ArtistId, ProductId, ProductMediaId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryMarketplace;
pub use postgres::PostgresMarketplace;

/// The artist's currently active self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistDescription {
    pub text: String,
    pub location: Option<String>,
    pub background_info: Option<String>,
    pub experience: Option<String>,
}

/// Everything needed to prompt a profile background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileContext {
    pub artist_id: ArtistId,
    pub profession: String,
    pub active_description: Option<ArtistDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMedia {
    pub id: ProductMediaId,
    pub image_url: String,
}

/// Everything needed to re-shoot a product's photos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductShootContext {
    pub product_id: ProductId,
    /// Category description, e.g. "Hand-thrown ceramics".
    pub art_form: String,
    pub product_description: Option<String>,
    pub media: Vec<ProductMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketplaceError {
    #[error("artist profile not found: {0}")]
    ArtistNotFound(ArtistId),
    #[error("product not found: {0}")]
    ProductNotFound(ProductId),
    #[error("product media not found: {0}")]
    MediaNotFound(ProductMediaId),
    #[error("marketplace storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait MarketplaceStore: Send + Sync {
    async fn profile_context(&self, artist_id: ArtistId) -> Result<Option<ProfileContext>, MarketplaceError>;

    async fn product_shoot_context(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductShootContext>, MarketplaceError>;

    /// Point the artist's profile at a generated background poster.
    async fn set_background_poster(&self, artist_id: ArtistId, url: &str) -> Result<(), MarketplaceError>;

    /// Record the generated shot for one product photo.
    async fn set_generated_image(&self, media_id: ProductMediaId, url: &str) -> Result<(), MarketplaceError>;
}

#[async_trait]
impl<M> MarketplaceStore for Arc<M>
where
    M: MarketplaceStore + ?Sized,
{
    async fn profile_context(&self, artist_id: ArtistId) -> Result<Option<ProfileContext>, MarketplaceError> {
        (**self).profile_context(artist_id).await
    }

    async fn product_shoot_context(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductShootContext>, MarketplaceError> {
        (**self).product_shoot_context(product_id).await
    }

    async fn set_background_poster(&self, artist_id: ArtistId, url: &str) -> Result<(), MarketplaceError> {
        (**self).set_background_poster(artist_id, url).await
    }

    async fn set_generated_image(&self, media_id: ProductMediaId, url: &str) -> Result<(), MarketplaceError> {
        (**self).set_generated_image(media_id, url).await
    }
}
