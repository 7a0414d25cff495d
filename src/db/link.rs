use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::core::Database;
use crate::entity::MatchMethod;
use crate::links::LinkStore;
use crate::TARGET_DB;

impl Database {
    /// Inserts a knowledge graph link unless the pair already exists. Returns
    /// true when a row was written.
    pub async fn add_external_link(
        &self,
        local_id: i64,
        external_id: &str,
        method: &str,
        confidence: f64,
    ) -> Result<bool, sqlx::Error> {
        let applied_at = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"
            INSERT INTO entity_external_links (local_id, external_id, method, confidence, applied_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(local_id, external_id) DO NOTHING
            "#,
        )
        .bind(local_id)
        .bind(external_id)
        .bind(method)
        .bind(confidence)
        .bind(applied_at)
        .execute(self.pool())
        .await?
        .rows_affected();

        debug!(
            target: TARGET_DB,
            "Link {} -> {} ({}): {}",
            local_id,
            external_id,
            method,
            if affected > 0 { "added" } else { "already present" }
        );
        Ok(affected > 0)
    }

    pub async fn add_same_as(
        &self,
        local_id_a: i64,
        local_id_b: i64,
        external_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let (a, b) = if local_id_a <= local_id_b {
            (local_id_a, local_id_b)
        } else {
            (local_id_b, local_id_a)
        };
        let affected = sqlx::query(
            r#"
            INSERT INTO entity_same_as (local_id_a, local_id_b, external_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(local_id_a, local_id_b) DO NOTHING
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(external_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    pub async fn get_external_links(&self, local_id: i64) -> Result<Vec<(String, String, f64)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT external_id, method, confidence
            FROM entity_external_links
            WHERE local_id = ?1
            ORDER BY external_id
            "#,
        )
        .bind(local_id)
        .fetch_all(self.pool())
        .await
    }
}

#[async_trait]
impl LinkStore for Database {
    async fn upsert_link(
        &self,
        local_id: i64,
        external_id: &str,
        method: MatchMethod,
        confidence: f64,
    ) -> Result<bool> {
        Ok(self
            .add_external_link(local_id, external_id, method.as_str(), confidence)
            .await?)
    }

    async fn upsert_same_as(&self, local_id_a: i64, local_id_b: i64, external_id: &str) -> Result<bool> {
        Ok(self.add_same_as(local_id_a, local_id_b, external_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Candidate, MatchResult, ResolvableEntity};
    use crate::links::{ApplyCounts, LinkApplier};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_links_are_written_once() {
        let db = Database::in_memory().await.unwrap();
        let brian_id = db.add_entity(&ResolvableEntity::new(0, "Brian Boru")).await.unwrap();
        let other_id = db.add_entity(&ResolvableEntity::new(0, "Brian Bóruma")).await.unwrap();

        let candidate = Candidate::new("Q310", "Brian Boru");
        let results = vec![
            MatchResult::matched(&ResolvableEntity::new(brian_id, "Brian Boru"), &candidate, MatchMethod::Rule, 1.0, vec![]),
            MatchResult::matched(&ResolvableEntity::new(other_id, "Brian Bóruma"), &candidate, MatchMethod::Fuzzy, 0.94, vec![]),
        ];

        let applier = LinkApplier::new(Arc::new(db.clone()));
        let first = applier.apply(&results, 0.5).await.unwrap();
        assert_eq!(first.applied, 2);
        let second = applier.apply(&results, 0.5).await.unwrap();
        assert_eq!(
            second,
            ApplyCounts {
                applied: 0,
                skipped_low_confidence: 0,
                already_present: 2,
                not_matched: 0,
            }
        );

        let links = db.get_external_links(other_id).await.unwrap();
        assert_eq!(links, vec![("Q310".to_string(), "fuzzy".to_string(), 0.94)]);

        let same_as = applier.apply_same_as(&results, 0.5).await.unwrap();
        assert_eq!(same_as.applied, 1);
        assert!(!db.add_same_as(other_id, brian_id, "Q310").await.unwrap());
        assert_eq!(db.link_counts().await.unwrap(), (2, 1));
    }
}
