use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::TARGET_DB;

const POOL_SIZE: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the last entity page ended: the next position and the id at the one before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct PageCursor {
    pub next_offset: usize,
    pub last_id: i64,
}

/// The entity store: read by the feed, written by the link applier.
#[derive(Clone, Debug)]
pub struct Database {
    pool: Pool<Sqlite>,
    pub(super) page_cursor: Arc<Mutex<Option<PageCursor>>>,
}

// Readers page through entities while the applier writes links, hence WAL.
fn connect_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .synchronous(SqliteSynchronous::Normal)
}

impl Database {
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Opens an existing entity database. The entities come from elsewhere, so
    /// a missing file is an error rather than an empty store.
    #[instrument(target = "db", level = "info")]
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        let path = Path::new(database_path);
        if !path.is_file() {
            return Err(sqlx::Error::Configuration(
                format!("Entity database '{}' not found", database_path).into(),
            ));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(connect_options(path))
            .await?;
        info!(target: TARGET_DB, "Opened entity database {}", database_path);

        let db = Database {
            pool,
            page_cursor: Arc::default(),
        };
        db.initialize_schema().await?;
        Ok(db)
    }

    /// A private in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        // Every connection to `sqlite::memory:` is a separate database, so keep one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Database {
            pool,
            page_cursor: Arc::default(),
        };
        db.initialize_schema().await?;
        Ok(db)
    }

    /// Row counts for the status report.
    pub async fn link_counts(&self) -> Result<(i64, i64), sqlx::Error> {
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_external_links")
            .fetch_one(self.pool())
            .await?;
        let same_as: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_same_as")
            .fetch_one(self.pool())
            .await?;
        Ok((links, same_as))
    }
}
