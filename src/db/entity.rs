use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::core::{Database, PageCursor};
use crate::entity::{EntityKind, ResolvableEntity, TemporalBounds};
use crate::runner::EntityFeed;
use crate::TARGET_DB;

fn entity_from_row(row: &SqliteRow) -> ResolvableEntity {
    let kind: Option<String> = row.get("kind");
    ResolvableEntity {
        local_id: row.get("id"),
        display_name: row.get("name"),
        kind: kind.as_deref().map(EntityKind::from).unwrap_or_default(),
        description: row.get("description"),
        bounds: TemporalBounds::new(row.get("start_year"), row.get("end_year")),
        external_id: row.get("external_id"),
    }
}

impl Database {
    /// Adds an entity and returns its id.
    pub async fn add_entity(&self, entity: &ResolvableEntity) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO entities (name, kind, description, start_year, end_year, external_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(&entity.display_name)
        .bind(entity.kind.to_string())
        .bind(&entity.description)
        .bind(entity.bounds.start)
        .bind(entity.bounds.end)
        .bind(&entity.external_id)
        .fetch_one(self.pool())
        .await?;

        Ok(result.get("id"))
    }

    pub async fn count_entities(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(self.pool())
            .await
    }

    /// Up to `limit` entities with an id above `after`, in id order, the stable
    /// order resumed runs rely on.
    pub async fn get_entities_after(
        &self,
        after: i64,
        limit: i64,
    ) -> Result<Vec<ResolvableEntity>, sqlx::Error> {
        debug!(target: TARGET_DB, "Fetching {} entities after id {}", limit, after);
        let rows = sqlx::query(
            r#"
            SELECT id, name, kind, description, start_year, end_year, external_id
            FROM entities
            WHERE id > ?1
            ORDER BY id
            LIMIT ?2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(entity_from_row).collect())
    }

    /// Id of the entity at position `offset - 1`, or `i64::MIN` for offset 0.
    /// `None` when the table has fewer than `offset` rows.
    async fn id_before(&self, offset: usize) -> Result<Option<i64>> {
        if offset == 0 {
            return Ok(Some(i64::MIN));
        }
        let cursor = self.page_cursor.lock().ok().and_then(|cursor| *cursor);
        if let Some(cursor) = cursor.filter(|c| c.next_offset == offset) {
            return Ok(Some(cursor.last_id));
        }

        // Only a jump (the first page of a resumed run) pays for the scan.
        debug!(target: TARGET_DB, "Seeking entity position {}", offset);
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT id FROM entities ORDER BY id LIMIT 1 OFFSET ?1")
                .bind(i64::try_from(offset - 1)?)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn get_entity(&self, entity_id: i64) -> Result<Option<ResolvableEntity>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, name, kind, description, start_year, end_year, external_id
            FROM entities
            WHERE id = ?1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(entity_from_row))
    }
}

#[async_trait]
impl EntityFeed for Database {
    async fn total(&self) -> Result<usize> {
        Ok(usize::try_from(self.count_entities().await?)?)
    }

    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<ResolvableEntity>> {
        let Some(after) = self.id_before(offset).await? else {
            return Ok(Vec::new());
        };
        let page = self.get_entities_after(after, i64::try_from(limit)?).await?;
        if let Some(last) = page.last() {
            if let Ok(mut cursor) = self.page_cursor.lock() {
                *cursor = Some(PageCursor {
                    next_offset: offset + page.len(),
                    last_id: last.local_id,
                });
            }
        }
        Ok(page)
    }

    async fn get(&self, local_id: i64) -> Result<Option<ResolvableEntity>> {
        Ok(self.get_entity(local_id).await?)
    }
}
