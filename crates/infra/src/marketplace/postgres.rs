//! Postgres-backed marketplace access.
//!
//! Reads from the application's `artist_profiles`, `professions`,
//! `artist_descriptions`, `products`, `categories` and `product_media`
//! tables. Writes only `artist_profiles.background_poster` and
//! `product_media.generated_url`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use atelier_core::{ArtistId, ProductId, ProductMediaId};

use super::{
    ArtistDescription, MarketplaceError, MarketplaceStore, ProductMedia, ProductShootContext, ProfileContext,
};

#[derive(Debug, Clone)]
pub struct PostgresMarketplace {
    pool: Arc<PgPool>,
}

impl PostgresMarketplace {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

fn storage(operation: &str, err: sqlx::Error) -> MarketplaceError {
    MarketplaceError::Storage(format!("{operation}: {err}"))
}

#[async_trait]
impl MarketplaceStore for PostgresMarketplace {
    #[instrument(skip(self), fields(artist_id = %artist_id), err)]
    async fn profile_context(&self, artist_id: ArtistId) -> Result<Option<ProfileContext>, MarketplaceError> {
        let row = sqlx::query(
            r#"
            SELECT
                ap.artist_id,
                p.name AS profession,
                d.description,
                d.location,
                d.background_info,
                d.experience
            FROM artist_profiles ap
            JOIN professions p ON p.id = ap.profession_id
            LEFT JOIN artist_descriptions d
                ON d.artist_id = ap.artist_id AND d.is_active
            WHERE ap.artist_id = $1
            ORDER BY d.created_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(artist_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("profile_context", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e| storage("profile_context", e);
        let description: Option<String> = row.try_get("description").map_err(decode)?;
        let active_description = match description {
            Some(text) => Some(ArtistDescription {
                text,
                location: row.try_get("location").map_err(decode)?,
                background_info: row.try_get("background_info").map_err(decode)?,
                experience: row.try_get("experience").map_err(decode)?,
            }),
            None => None,
        };

        Ok(Some(ProfileContext {
            artist_id,
            profession: row.try_get("profession").map_err(decode)?,
            active_description,
        }))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn product_shoot_context(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductShootContext>, MarketplaceError> {
        let product = sqlx::query(
            r#"
            SELECT c.description AS art_form, pr.description
            FROM products pr
            JOIN categories c ON c.id = pr.category_id
            WHERE pr.id = $1
            "#,
        )
        .bind(product_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("product_shoot_context", e))?;

        let Some(product) = product else {
            return Ok(None);
        };

        let media_rows = sqlx::query("SELECT id, url FROM product_media WHERE product_id = $1 ORDER BY id")
            .bind(product_id.get())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage("product_shoot_context", e))?;

        let decode = |e| storage("product_shoot_context", e);
        let mut media = Vec::with_capacity(media_rows.len());
        for row in media_rows {
            media.push(ProductMedia {
                id: ProductMediaId::new(row.try_get("id").map_err(decode)?),
                image_url: row.try_get("url").map_err(decode)?,
            });
        }

        Ok(Some(ProductShootContext {
            product_id,
            art_form: product.try_get::<Option<String>, _>("art_form").map_err(decode)?.unwrap_or_default(),
            product_description: product.try_get("description").map_err(decode)?,
            media,
        }))
    }

    #[instrument(skip(self, url), fields(artist_id = %artist_id), err)]
    async fn set_background_poster(&self, artist_id: ArtistId, url: &str) -> Result<(), MarketplaceError> {
        let result = sqlx::query("UPDATE artist_profiles SET background_poster = $2 WHERE artist_id = $1")
            .bind(artist_id.get())
            .bind(url)
            .execute(&*self.pool)
            .await
            .map_err(|e| storage("set_background_poster", e))?;

        if result.rows_affected() == 0 {
            return Err(MarketplaceError::ArtistNotFound(artist_id));
        }
        Ok(())
    }

    #[instrument(skip(self, url), fields(media_id = %media_id), err)]
    async fn set_generated_image(&self, media_id: ProductMediaId, url: &str) -> Result<(), MarketplaceError> {
        let result = sqlx::query("UPDATE product_media SET generated_url = $2 WHERE id = $1")
            .bind(media_id.get())
            .bind(url)
            .execute(&*self.pool)
            .await
            .map_err(|e| storage("set_generated_image", e))?;

        if result.rows_affected() == 0 {
            return Err(MarketplaceError::MediaNotFound(media_id));
        }
        Ok(())
    }
}
