//! Uploaded media rows

use sqlx::{QueryBuilder, Sqlite};

use super::Database;
use crate::error::Result;
use crate::types::Media;

impl Database {
    /// Store media rows in one transaction. Rows already present are kept.
    pub async fn store_media(&self, media: &[Media]) -> Result<()> {
        if media.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for m in media {
            sqlx::query(
                "INSERT INTO media (id, mime_type, name, url, resource_id, duration_ns)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&m.id)
            .bind(&m.mime_type)
            .bind(&m.name)
            .bind(&m.url)
            .bind(&m.resource_id)
            .bind(m.duration_ns)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Media rows for `ids`, in no particular order. Unknown ids are skipped.
    pub async fn lookup_media(&self, ids: &[String]) -> Result<Vec<Media>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, mime_type, name, url, resource_id, duration_ns FROM media WHERE id IN (",
        );
        let mut list = qb.separated(", ");
        for id in ids {
            list.push_bind(id);
        }
        list.push_unseparated(")");
        Ok(qb.build_query_as::<Media>().fetch_all(&self.pool).await?)
    }
}
