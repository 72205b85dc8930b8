//! In-memory marketplace for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use atelier_core::{ArtistId, ProductId, ProductMediaId};

use super::{MarketplaceError, MarketplaceStore, ProductShootContext, ProfileContext};

#[derive(Debug, Default)]
struct State {
    profiles: HashMap<ArtistId, ProfileContext>,
    products: HashMap<ProductId, ProductShootContext>,
    background_posters: HashMap<ArtistId, String>,
    generated_images: HashMap<ProductMediaId, String>,
    fail_writes: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryMarketplace {
    state: RwLock<State>,
}

impl InMemoryMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_profile(&self, profile: ProfileContext) {
        let mut state = self.state.write().unwrap();
        state.profiles.insert(profile.artist_id, profile);
    }

    pub fn add_product(&self, product: ProductShootContext) {
        let mut state = self.state.write().unwrap();
        state.products.insert(product.product_id, product);
    }

    /// Make every result write fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.write().unwrap().fail_writes = fail;
    }

    pub fn background_poster(&self, artist_id: ArtistId) -> Option<String> {
        self.state.read().unwrap().background_posters.get(&artist_id).cloned()
    }

    pub fn generated_image(&self, media_id: ProductMediaId) -> Option<String> {
        self.state.read().unwrap().generated_images.get(&media_id).cloned()
    }
}

#[async_trait]
impl MarketplaceStore for InMemoryMarketplace {
    async fn profile_context(&self, artist_id: ArtistId) -> Result<Option<ProfileContext>, MarketplaceError> {
        Ok(self.state.read().unwrap().profiles.get(&artist_id).cloned())
    }

    async fn product_shoot_context(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductShootContext>, MarketplaceError> {
        Ok(self.state.read().unwrap().products.get(&product_id).cloned())
    }

    async fn set_background_poster(&self, artist_id: ArtistId, url: &str) -> Result<(), MarketplaceError> {
        let mut state = self.state.write().unwrap();
        if state.fail_writes {
            return Err(MarketplaceError::Storage("scripted write failure".into()));
        }
        if !state.profiles.contains_key(&artist_id) {
            return Err(MarketplaceError::ArtistNotFound(artist_id));
        }
        state.background_posters.insert(artist_id, url.to_string());
        Ok(())
    }

    async fn set_generated_image(&self, media_id: ProductMediaId, url: &str) -> Result<(), MarketplaceError> {
        let mut state = self.state.write().unwrap();
        if state.fail_writes {
            return Err(MarketplaceError::Storage("scripted write failure".into()));
        }
        let known = state
            .products
            .values()
            .any(|p| p.media.iter().any(|m| m.id == media_id));
        if !known {
            return Err(MarketplaceError::MediaNotFound(media_id));
        }
        state.generated_images.insert(media_id, url.to_string());
        Ok(())
    }
}
