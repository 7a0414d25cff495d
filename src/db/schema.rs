use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'other', -- person, place, event, other
                description TEXT,
                start_year INTEGER, -- birth year for persons
                end_year INTEGER, -- death year for persons
                external_id TEXT -- already known knowledge graph id, if any
            );

            CREATE TABLE IF NOT EXISTS entity_external_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_id INTEGER NOT NULL,
                external_id TEXT NOT NULL,
                method TEXT NOT NULL, -- rule, fuzzy, embedding, llm
                confidence REAL NOT NULL,
                applied_at TEXT NOT NULL,
                UNIQUE(local_id, external_id),
                FOREIGN KEY (local_id) REFERENCES entities (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_entity_external_links_external_id ON entity_external_links (external_id);

            CREATE TABLE IF NOT EXISTS entity_same_as (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_id_a INTEGER NOT NULL, -- always the smaller id
                local_id_b INTEGER NOT NULL,
                external_id TEXT NOT NULL,
                UNIQUE(local_id_a, local_id_b),
                FOREIGN KEY (local_id_a) REFERENCES entities (id) ON DELETE CASCADE,
                FOREIGN KEY (local_id_b) REFERENCES entities (id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Schema initialized");
        Ok(())
    }
}
