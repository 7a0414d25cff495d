use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{promote_hinted, CandidateFetch, CandidateSource};
use crate::entity::normalizer::exact_key;
use crate::entity::Candidate;

/// In-memory candidate source keyed by case-insensitive name.
///
/// Used for offline dry runs and throughout the tests; counts every call.
#[derive(Debug, Default)]
pub struct StaticCandidateSource {
    by_name: HashMap<String, Vec<Candidate>>,
    // Remaining failures per name.
    failing: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl StaticCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidates(mut self, name: &str, candidates: Vec<Candidate>) -> Self {
        self.by_name.insert(exact_key(name), candidates);
        self
    }

    /// Queries for `name` always fail with a transient error.
    pub fn with_failure(self, name: &str) -> Self {
        self.with_failures(name, usize::MAX)
    }

    /// The first `times` queries for `name` fail, later ones succeed.
    pub fn with_failures(mut self, name: &str, times: usize) -> Self {
        if let Ok(failing) = self.failing.get_mut() {
            failing.insert(exact_key(name), times);
        }
        self
    }

    fn take_failure(&self, key: &str) -> bool {
        let mut failing = match self.failing.lock() {
            Ok(failing) => failing,
            Err(poisoned) => poisoned.into_inner(),
        };
        match failing.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn fetch(&self, name: &str, hint: Option<&str>) -> CandidateFetch {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = exact_key(name);
        if self.take_failure(&key) {
            return CandidateFetch::failed(format!("transient remote failure: search for '{}' timed out", name));
        }
        let candidates = self.by_name.get(&key).cloned().unwrap_or_default();
        CandidateFetch::found(promote_hinted(candidates, hint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_is_case_insensitive_and_counted() {
        let source = StaticCandidateSource::new()
            .with_candidates("Brian Boru", vec![Candidate::new("Q11", "Brian Boru")])
            .with_failure("Niall");

        let found = source.fetch("brian  boru", None).await;
        assert_eq!(found.candidates.len(), 1);
        assert!(found.error.is_none());

        let missing = source.fetch("Conn", None).await;
        assert!(missing.candidates.is_empty());
        assert!(missing.error.is_none());

        let failed = source.fetch("Niall", None).await;
        assert!(failed.candidates.is_empty());
        assert!(failed.error.is_some());

        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_failures_run_out() {
        let source = StaticCandidateSource::new()
            .with_candidates("Aed", vec![Candidate::new("Q1", "Aed")])
            .with_failures("Aed", 1);
        assert!(source.fetch("Aed", None).await.error.is_some());
        assert_eq!(source.fetch("Aed", None).await.candidates.len(), 1);
    }
}
