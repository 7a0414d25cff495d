//! Writes accepted matches back to the entity store.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointResult, CheckpointStore};
use crate::entity::{MatchMethod, MatchResult};
use crate::TARGET_DB;

/// Write side of the entity store. Both operations are idempotent upserts and
/// report whether a new row was written.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn upsert_link(
        &self,
        local_id: i64,
        external_id: &str,
        method: MatchMethod,
        confidence: f64,
    ) -> Result<bool>;

    /// Records that two local entities name the same external entity; `local_id_a < local_id_b`.
    async fn upsert_same_as(&self, local_id_a: i64, local_id_b: i64, external_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub applied: usize,
    pub skipped_low_confidence: usize,
    pub already_present: usize,
    pub not_matched: usize,
}

impl AddAssign for ApplyCounts {
    fn add_assign(&mut self, other: Self) {
        self.applied += other.applied;
        self.skipped_low_confidence += other.skipped_low_confidence;
        self.already_present += other.already_present;
        self.not_matched += other.not_matched;
    }
}

/// Latest result per entity across the main and follow-up stores, read one
/// chunk at a time. Only the position of each entity's latest result is held
/// in memory; follow-up results supersede the main run's.
pub struct LatestResults<'a> {
    stores: [&'a dyn CheckpointStore; 2],
    /// local id -> (store, chunk, position in chunk)
    positions: HashMap<i64, (usize, usize, usize)>,
}

impl<'a> LatestResults<'a> {
    pub fn index(
        main: &'a dyn CheckpointStore,
        followup: &'a dyn CheckpointStore,
    ) -> CheckpointResult<Self> {
        let stores = [main, followup];
        let mut positions = HashMap::new();
        for (s, store) in stores.iter().enumerate() {
            for (c, chunk) in store.chunks().enumerate() {
                for (i, result) in chunk?.results.iter().enumerate() {
                    positions.insert(result.local_id, (s, c, i));
                }
            }
        }
        debug!(target: TARGET_DB, "Indexed latest results for {} entities", positions.len());
        Ok(Self { stores, positions })
    }

    /// Number of distinct entities with a result.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The latest results, one committed chunk per batch, in commit order.
    pub fn batches(&self) -> impl Iterator<Item = CheckpointResult<Vec<MatchResult>>> + '_ {
        self.stores
            .iter()
            .copied()
            .enumerate()
            .flat_map(move |(s, store)| {
                store.chunks().enumerate().map(move |(c, chunk)| -> CheckpointResult<Vec<MatchResult>> {
                    Ok(chunk?
                        .results
                        .into_iter()
                        .enumerate()
                        .filter(|(i, result)| self.positions.get(&result.local_id) == Some(&(s, c, *i)))
                        .map(|(_, result)| result)
                        .collect())
                })
            })
    }
}

/// Local ids grouped by the external id they matched, for same-as edges.
#[derive(Debug, Default)]
pub struct SameAsGroups {
    by_external: BTreeMap<String, Vec<i64>>,
    counts: ApplyCounts,
}

impl SameAsGroups {
    pub fn add(&mut self, results: &[MatchResult], min_confidence: f64) {
        for (result, external_id) in LinkApplier::eligible(results, min_confidence, &mut self.counts) {
            self.by_external
                .entry(external_id.to_string())
                .or_default()
                .push(result.local_id);
        }
    }
}

fn check_min_confidence(min_confidence: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&min_confidence) {
        bail!("Minimum confidence must be between 0 and 1, got {}", min_confidence);
    }
    Ok(())
}

pub struct LinkApplier {
    store: Arc<dyn LinkStore>,
}

impl LinkApplier {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        Self { store }
    }

    /// Splits results into those eligible for writing and the counts of those that are not.
    fn eligible<'a>(results: &'a [MatchResult], min_confidence: f64, counts: &mut ApplyCounts) -> Vec<(&'a MatchResult, &'a str)> {
        let mut eligible = Vec::new();
        for result in results {
            match result.matched_external_id.as_deref() {
                Some(external_id) if result.is_matched() => {
                    if result.confidence >= min_confidence {
                        eligible.push((result, external_id));
                    } else {
                        counts.skipped_low_confidence += 1;
                    }
                }
                _ => counts.not_matched += 1,
            }
        }
        eligible
    }

    async fn write_links(&self, results: &[MatchResult], min_confidence: f64) -> Result<ApplyCounts> {
        let mut counts = ApplyCounts::default();
        for (result, external_id) in Self::eligible(results, min_confidence, &mut counts) {
            let written = self
                .store
                .upsert_link(result.local_id, external_id, result.method, result.confidence)
                .await?;
            if written {
                counts.applied += 1;
            } else {
                counts.already_present += 1;
            }
        }
        Ok(counts)
    }

    pub async fn apply(&self, results: &[MatchResult], min_confidence: f64) -> Result<ApplyCounts> {
        check_min_confidence(min_confidence)?;
        let counts = self.write_links(results, min_confidence).await?;
        log_links(&counts, min_confidence);
        Ok(counts)
    }

    /// Applies the latest result of every entity, streaming chunk by chunk.
    /// Same-as edges are written afterwards when `same_as` is set.
    pub async fn apply_latest(
        &self,
        latest: &LatestResults<'_>,
        min_confidence: f64,
        same_as: bool,
    ) -> Result<(ApplyCounts, Option<ApplyCounts>)> {
        check_min_confidence(min_confidence)?;
        let mut counts = ApplyCounts::default();
        let mut groups = SameAsGroups::default();

        for batch in latest.batches() {
            let batch = batch?;
            counts += self.write_links(&batch, min_confidence).await?;
            if same_as {
                groups.add(&batch, min_confidence);
            }
        }
        log_links(&counts, min_confidence);

        let edges = if same_as {
            Some(self.write_same_as(groups).await?)
        } else {
            None
        };
        Ok((counts, edges))
    }

    /// Links local entities that resolved to the same external id to each other.
    pub async fn apply_same_as(&self, results: &[MatchResult], min_confidence: f64) -> Result<ApplyCounts> {
        check_min_confidence(min_confidence)?;
        let mut groups = SameAsGroups::default();
        groups.add(results, min_confidence);
        self.write_same_as(groups).await
    }

    async fn write_same_as(&self, groups: SameAsGroups) -> Result<ApplyCounts> {
        let mut counts = groups.counts;
        for (external_id, mut local_ids) in groups.by_external {
            local_ids.sort_unstable();
            local_ids.dedup();
            for (i, &a) in local_ids.iter().enumerate() {
                for &b in &local_ids[i + 1..] {
                    if self.store.upsert_same_as(a, b, &external_id).await? {
                        counts.applied += 1;
                    } else {
                        counts.already_present += 1;
                    }
                }
            }
        }

        info!(
            target: TARGET_DB,
            "Applied {} same-as edges ({} already present)", counts.applied, counts.already_present
        );
        Ok(counts)
    }
}

fn log_links(counts: &ApplyCounts, min_confidence: f64) {
    info!(
        target: TARGET_DB,
        "Applied {} links ({} already present, {} below {:.2}, {} not matched)",
        counts.applied,
        counts.already_present,
        counts.skipped_low_confidence,
        min_confidence,
        counts.not_matched
    );
}

/// Link store held in memory; for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    links: Mutex<HashSet<(i64, String)>>,
    same_as: Mutex<HashSet<(i64, i64)>>,
}

impl MemoryLinkStore {
    pub fn links(&self) -> Vec<(i64, String)> {
        let mut links: Vec<_> = self
            .links
            .lock()
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default();
        links.sort();
        links
    }

    pub fn same_as(&self) -> Vec<(i64, i64)> {
        let mut edges: Vec<_> = self
            .same_as
            .lock()
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default();
        edges.sort();
        edges
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn upsert_link(
        &self,
        local_id: i64,
        external_id: &str,
        method: MatchMethod,
        confidence: f64,
    ) -> Result<bool> {
        debug!(target: TARGET_DB, "Link {} -> {} ({}, {:.3})", local_id, external_id, method, confidence);
        let mut links = self
            .links
            .lock()
            .map_err(|_| anyhow::anyhow!("link store lock poisoned"))?;
        Ok(links.insert((local_id, external_id.to_string())))
    }

    async fn upsert_same_as(&self, local_id_a: i64, local_id_b: i64, _external_id: &str) -> Result<bool> {
        let mut edges = self
            .same_as
            .lock()
            .map_err(|_| anyhow::anyhow!("link store lock poisoned"))?;
        Ok(edges.insert((local_id_a, local_id_b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ChunkedCheckpointStore;
    use crate::entity::{Candidate, ResolvableEntity};
    use tempfile::TempDir;

    fn results() -> Vec<MatchResult> {
        let brian = Candidate::new("Q310", "Brian Boru");
        vec![
            MatchResult::matched(&ResolvableEntity::new(1, "Brian Boru"), &brian, MatchMethod::Rule, 1.0, vec![]),
            MatchResult::matched(&ResolvableEntity::new(2, "Brian Bóruma"), &brian, MatchMethod::Fuzzy, 0.95, vec![]),
            MatchResult::matched(
                &ResolvableEntity::new(3, "Aed"),
                &Candidate::new("Q1", "Aed Oirdnide"),
                MatchMethod::Llm,
                0.6,
                vec![],
            ),
            MatchResult::ambiguous(&ResolvableEntity::new(4, "Niall")),
            MatchResult::unmatched(&ResolvableEntity::new(5, "Conn")),
        ]
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = Arc::new(MemoryLinkStore::default());
        let applier = LinkApplier::new(store.clone());

        let first = applier.apply(&results(), 0.0).await.unwrap();
        assert_eq!(
            first,
            ApplyCounts {
                applied: 3,
                skipped_low_confidence: 0,
                already_present: 0,
                not_matched: 2,
            }
        );

        let second = applier.apply(&results(), 0.0).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.already_present, 3);
        assert_eq!(store.links().len(), 3);
    }

    #[tokio::test]
    async fn test_min_confidence_gate() {
        let store = Arc::new(MemoryLinkStore::default());
        let applier = LinkApplier::new(store.clone());
        let counts = applier.apply(&results(), 0.9).await.unwrap();
        assert_eq!(counts.applied, 2);
        assert_eq!(counts.skipped_low_confidence, 1);
        assert!(!store.links().contains(&(3, "Q1".to_string())));

        assert!(applier.apply(&results(), 1.5).await.is_err());
    }

    #[tokio::test]
    async fn test_same_as_edges_are_ordered() {
        let store = Arc::new(MemoryLinkStore::default());
        let applier = LinkApplier::new(store.clone());
        let mut reversed = results();
        reversed.reverse();

        let counts = applier.apply_same_as(&reversed, 0.0).await.unwrap();
        assert_eq!(counts.applied, 1);
        assert_eq!(store.same_as(), vec![(1, 2)]);

        let again = applier.apply_same_as(&results(), 0.0).await.unwrap();
        assert_eq!(again.already_present, 1);
    }

    fn stores(dir: &TempDir) -> (ChunkedCheckpointStore, ChunkedCheckpointStore) {
        let mut main = ChunkedCheckpointStore::new(dir.path().join("main"), 2);
        let mut followup = ChunkedCheckpointStore::new(dir.path().join("followup"), 2);
        main.load().unwrap();
        followup.load().unwrap();
        (main, followup)
    }

    #[test]
    fn test_followup_results_supersede() {
        let dir = TempDir::new().unwrap();
        let (mut main, mut followup) = stores(&dir);

        let aed = ResolvableEntity::new(3, "Aed");
        main.append(
            &[MatchResult::unmatched(&ResolvableEntity::new(5, "Conn")), MatchResult::ambiguous(&aed)],
            vec![],
            "",
        )
        .unwrap();
        let resolved = MatchResult::matched(&aed, &Candidate::new("Q1", "Aed Oirdnide"), MatchMethod::Llm, 0.8, vec![]);
        followup.append(&[resolved.clone()], vec![], "").unwrap();

        let latest = LatestResults::index(&main, &followup).unwrap();
        assert_eq!(latest.len(), 2);
        let batches: Vec<Vec<MatchResult>> = latest.batches().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(ids(&batches[0]), vec![5]);
        assert_eq!(batches[1], vec![resolved]);
    }

    fn ids(results: &[MatchResult]) -> Vec<i64> {
        results.iter().map(|r| r.local_id).collect()
    }

    #[tokio::test]
    async fn test_apply_latest_skips_superseded_results() {
        let dir = TempDir::new().unwrap();
        let (mut main, mut followup) = stores(&dir);

        // Chunk capacity 2, so the main results span three chunks.
        main.append(&results(), vec![], "").unwrap();
        let niall = ResolvableEntity::new(4, "Niall");
        let aed = ResolvableEntity::new(3, "Aed");
        followup
            .append(
                &[
                    MatchResult::matched(&niall, &Candidate::new("Q310", "Brian Boru"), MatchMethod::Llm, 0.7, vec![]),
                    MatchResult::failed(&aed, "timed out"),
                ],
                vec![],
                "",
            )
            .unwrap();

        let store = Arc::new(MemoryLinkStore::default());
        let applier = LinkApplier::new(store.clone());
        let latest = LatestResults::index(&main, &followup).unwrap();
        let (links, edges) = applier.apply_latest(&latest, 0.5, true).await.unwrap();

        assert_eq!(links.applied, 3);
        assert_eq!(links.not_matched, 2);
        assert_eq!(
            store.links(),
            vec![(1, "Q310".to_string()), (2, "Q310".to_string()), (4, "Q310".to_string())]
        );
        assert_eq!(edges.map(|e| e.applied), Some(3));
        assert_eq!(store.same_as(), vec![(1, 2), (1, 4), (2, 4)]);

        let (again, _) = applier.apply_latest(&latest, 0.5, false).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.already_present, 3);
    }
}
