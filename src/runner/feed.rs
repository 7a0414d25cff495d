use anyhow::Result;
use async_trait::async_trait;

use crate::entity::ResolvableEntity;

/// Read side of the entity store. Pages must come back in the same stable
/// order on every call, or resumed runs will refuse to continue.
#[async_trait]
pub trait EntityFeed: Send + Sync {
    async fn total(&self) -> Result<usize>;

    /// Up to `limit` entities starting at position `offset`.
    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<ResolvableEntity>>;

    async fn get(&self, local_id: i64) -> Result<Option<ResolvableEntity>>;
}

/// In-memory feed, ordered as given.
#[derive(Debug, Clone, Default)]
pub struct VecFeed {
    entities: Vec<ResolvableEntity>,
}

impl VecFeed {
    pub fn new(entities: Vec<ResolvableEntity>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl EntityFeed for VecFeed {
    async fn total(&self) -> Result<usize> {
        Ok(self.entities.len())
    }

    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<ResolvableEntity>> {
        Ok(self
            .entities
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, local_id: i64) -> Result<Option<ResolvableEntity>> {
        Ok(self
            .entities
            .iter()
            .find(|entity| entity.local_id == local_id)
            .cloned())
    }
}
