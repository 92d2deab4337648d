//! PostgreSQL implementation of [`RemoteMetadataStore`].
//!
//! Every query is scoped by the session's user id. Deletes set `deleted_at`
//! and `list_*` only returns rows where it is null. Updates touch only the
//! columns present in the patch.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use vitrine_core::logging::SUBSYSTEM_REMOTE;
use vitrine_core::{
    CategoryUpdate, Error, ImageUpdate, NewRemoteCategory, NewRemoteImage, RemoteCategory,
    RemoteId, RemoteImage, RemoteMetadataStore, Result, Session,
};

use crate::pool::RemotePoolOptions;

const CATEGORY_COLUMNS: &str =
    "id, name, cover_image, notes, tags, is_favorite, is_private, password_hash";

const IMAGE_COLUMNS: &str =
    "id, category_id, object_key, pose_name, notes, tags, is_favorite, size_bytes, created_at";

/// Metadata store backed by the `gallery_category` / `gallery_image` tables.
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a pool sized for the default engine concurrency.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, &RemotePoolOptions::default()).await
    }

    pub async fn connect_with(database_url: &str, options: &RemotePoolOptions) -> Result<Self> {
        Ok(Self::new(options.connect(database_url).await?))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn category_from_row(row: &PgRow) -> RemoteCategory {
    RemoteCategory {
        id: row.get("id"),
        name: row.get("name"),
        cover_image: row.get("cover_image"),
        notes: row.get("notes"),
        tags: row.get("tags"),
        is_favorite: row.get("is_favorite"),
        is_private: row.get("is_private"),
        password_hash: row.get("password_hash"),
    }
}

fn image_from_row(row: &PgRow) -> RemoteImage {
    RemoteImage {
        id: row.get("id"),
        category_id: row.get("category_id"),
        object_key: row.get("object_key"),
        pose_name: row.get("pose_name"),
        notes: row.get("notes"),
        tags: row.get("tags"),
        is_favorite: row.get("is_favorite"),
        size_bytes: row.get("size_bytes"),
        created_at: row.get("created_at"),
    }
}

/// Split a clearable field into (touch?, new value) bind parameters.
fn clearable(field: &Option<Option<String>>) -> (bool, Option<String>) {
    match field {
        Some(value) => (true, value.clone()),
        None => (false, None),
    }
}

#[async_trait]
impl RemoteMetadataStore for PgMetadataStore {
    async fn list_categories(&self, session: &Session) -> Result<Vec<RemoteCategory>> {
        let rows = sqlx::query(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM gallery_category
             WHERE user_id = $1 AND deleted_at IS NULL
             ORDER BY id"
        ))
        .bind(session.user_id())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(category_from_row).collect())
    }

    async fn list_images(
        &self,
        session: &Session,
        category_id: RemoteId,
    ) -> Result<Vec<RemoteImage>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM gallery_image
             WHERE user_id = $1 AND category_id = $2 AND deleted_at IS NULL
             ORDER BY id"
        ))
        .bind(session.user_id())
        .bind(category_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(image_from_row).collect())
    }

    async fn list_all_images(&self, session: &Session) -> Result<Vec<RemoteImage>> {
        let rows = sqlx::query(
            "SELECT i.id, i.category_id, i.object_key, i.pose_name, i.notes, i.tags,
                    i.is_favorite, i.size_bytes, i.created_at
             FROM gallery_image i
             JOIN gallery_category c ON c.id = i.category_id AND c.deleted_at IS NULL
             WHERE i.user_id = $1 AND i.deleted_at IS NULL
             ORDER BY i.category_id, i.id",
        )
        .bind(session.user_id())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(image_from_row).collect())
    }

    async fn create_category(
        &self,
        session: &Session,
        req: &NewRemoteCategory,
    ) -> Result<RemoteCategory> {
        let row = sqlx::query(&format!(
            "INSERT INTO gallery_category
                (user_id, name, cover_image, notes, tags, is_favorite, is_private, password_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {CATEGORY_COLUMNS}"
        ))
        .bind(session.user_id())
        .bind(&req.name)
        .bind(&req.cover_image)
        .bind(&req.notes)
        .bind(&req.tags)
        .bind(req.is_favorite)
        .bind(req.is_private)
        .bind(&req.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let created = category_from_row(&row);
        debug!(
            subsystem = SUBSYSTEM_REMOTE,
            component = "metadata",
            op = "create_category",
            remote_id = created.id,
            "Category row created"
        );
        Ok(created)
    }

    async fn update_category(
        &self,
        session: &Session,
        id: RemoteId,
        update: &CategoryUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let (set_cover, cover) = clearable(&update.cover_image);
        let (set_hash, hash) = clearable(&update.private_password_hash);

        let result = sqlx::query(
            "UPDATE gallery_category SET
                name          = COALESCE($3, name),
                cover_image   = CASE WHEN $4 THEN $5 ELSE cover_image END,
                notes         = COALESCE($6, notes),
                tags          = COALESCE($7, tags),
                is_favorite   = COALESCE($8, is_favorite),
                is_private    = COALESCE($9, is_private),
                password_hash = CASE WHEN $10 THEN $11 ELSE password_hash END,
                updated_at    = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(session.user_id())
        .bind(&update.name)
        .bind(set_cover)
        .bind(cover)
        .bind(&update.notes)
        .bind(&update.tags)
        .bind(update.is_favorite)
        .bind(update.is_private)
        .bind(set_hash)
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("category {}", id)));
        }
        Ok(())
    }

    async fn delete_category(&self, session: &Session, id: RemoteId) -> Result<()> {
        sqlx::query(
            "UPDATE gallery_category SET deleted_at = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(session.user_id())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn create_image(
        &self,
        session: &Session,
        category_id: RemoteId,
        req: &NewRemoteImage,
    ) -> Result<RemoteImage> {
        // Insert only under a live category owned by the same user.
        let row = sqlx::query(&format!(
            "INSERT INTO gallery_image
                (user_id, category_id, object_key, pose_name, notes, tags, is_favorite,
                 size_bytes, created_at)
             SELECT $1, c.id, $3, $4, $5, $6, $7, $8, $9
             FROM gallery_category c
             WHERE c.id = $2 AND c.user_id = $1 AND c.deleted_at IS NULL
             RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(session.user_id())
        .bind(category_id)
        .bind(&req.object_key)
        .bind(&req.pose_name)
        .bind(&req.notes)
        .bind(&req.tags)
        .bind(req.is_favorite)
        .bind(req.size_bytes)
        .bind(req.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let row = row.ok_or_else(|| Error::NotFound(format!("category {}", category_id)))?;
        let created = image_from_row(&row);
        debug!(
            subsystem = SUBSYSTEM_REMOTE,
            component = "metadata",
            op = "create_image",
            remote_id = created.id,
            object_key = %created.object_key,
            "Image row created"
        );
        Ok(created)
    }

    async fn update_image(
        &self,
        session: &Session,
        id: RemoteId,
        update: &ImageUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let result = sqlx::query(
            "UPDATE gallery_image SET
                pose_name   = COALESCE($3, pose_name),
                notes       = COALESCE($4, notes),
                tags        = COALESCE($5, tags),
                is_favorite = COALESCE($6, is_favorite),
                updated_at  = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(session.user_id())
        .bind(&update.pose_name)
        .bind(&update.notes)
        .bind(&update.tags)
        .bind(update.is_favorite)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("image {}", id)));
        }
        Ok(())
    }

    async fn delete_image(&self, session: &Session, id: RemoteId) -> Result<()> {
        sqlx::query(
            "UPDATE gallery_image SET deleted_at = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(session.user_id())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clearable_distinguishes_leave_and_clear() {
        assert_eq!(clearable(&None), (false, None));
        assert_eq!(clearable(&Some(None)), (true, None));
        assert_eq!(
            clearable(&Some(Some("cover.jpg".into()))),
            (true, Some("cover.jpg".to_string()))
        );
    }
}
