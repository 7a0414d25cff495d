use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{MatchDecision, MatchMethod, MatchResult, PendingAdjudication};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;
pub const DEFAULT_CHUNK_CAPACITY: usize = 500;

/// Running counters over every committed result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodStats {
    #[serde(default)]
    pub rule: u64,
    #[serde(default)]
    pub fuzzy: u64,
    #[serde(default)]
    pub embedding: u64,
    #[serde(default)]
    pub llm: u64,
    #[serde(default)]
    pub unmatched: u64,
    #[serde(default)]
    pub ambiguous: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub total: u64,
}

impl MethodStats {
    pub fn record(&mut self, result: &MatchResult) {
        self.total += 1;
        if result.error.is_some() {
            self.failed += 1;
        }
        match result.decision {
            MatchDecision::Ambiguous => self.ambiguous += 1,
            MatchDecision::Unmatched => self.unmatched += 1,
            MatchDecision::Matched => match result.method {
                MatchMethod::Rule => self.rule += 1,
                MatchMethod::Fuzzy => self.fuzzy += 1,
                MatchMethod::Embedding => self.embedding += 1,
                MatchMethod::Llm => self.llm += 1,
                MatchMethod::None => self.unmatched += 1,
            },
        }
    }

    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a MatchResult>) -> Self {
        let mut stats = Self::default();
        for result in results {
            stats.record(result);
        }
        stats
    }

    pub fn matched(&self) -> u64 {
        self.rule + self.fuzzy + self.embedding + self.llm
    }
}

/// The small state document; everything needed to resume without reading any
/// chunk body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub format_version: u32,
    pub last_offset: usize,
    #[serde(default)]
    pub stats: MethodStats,
    pub result_chunks: usize,
    #[serde(default)]
    pub chunk_sizes: Vec<usize>,
    pub total_results: usize,
    pub chunk_capacity: usize,
    #[serde(default)]
    pub ordering_digest: String,
    #[serde(default)]
    pub llm_pending: Vec<PendingAdjudication>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn empty(chunk_capacity: usize) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            last_offset: 0,
            stats: MethodStats::default(),
            result_chunks: 0,
            chunk_sizes: Vec::new(),
            total_results: 0,
            chunk_capacity: chunk_capacity.max(1),
            ordering_digest: String::new(),
            llm_pending: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Checks the counters against each other. Returns a description of the
    /// first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {} (expected {})",
                self.format_version, CHECKPOINT_FORMAT_VERSION
            ));
        }
        if self.chunk_capacity == 0 {
            return Err("chunk_capacity is 0".to_string());
        }
        if self.chunk_sizes.len() != self.result_chunks {
            return Err(format!(
                "{} chunk sizes recorded for {} chunks",
                self.chunk_sizes.len(),
                self.result_chunks
            ));
        }
        if let Some((index, size)) = self
            .chunk_sizes
            .iter()
            .enumerate()
            .find(|(_, size)| **size == 0 || **size > self.chunk_capacity)
        {
            return Err(format!(
                "chunk {} holds {} results (capacity {})",
                index, size, self.chunk_capacity
            ));
        }
        let summed: usize = self.chunk_sizes.iter().sum();
        if self.last_offset != self.total_results || self.total_results != summed {
            return Err(format!(
                "last_offset {} / total_results {} / chunk sizes sum {} disagree",
                self.last_offset, self.total_results, summed
            ));
        }
        if self.stats.total != self.total_results as u64 {
            return Err(format!(
                "stats count {} results but {} were committed",
                self.stats.total, self.total_results
            ));
        }
        Ok(())
    }

    /// Offset of the first result stored in chunk `index`.
    pub fn chunk_start(&self, index: usize) -> usize {
        self.chunk_sizes.iter().take(index).sum()
    }

    /// Fraction of committed results that recorded an error.
    pub fn failure_rate(&self) -> f64 {
        if self.stats.total == 0 {
            0.0
        } else {
            self.stats.failed as f64 / self.stats.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Candidate, ResolvableEntity};

    #[test]
    fn test_stats_by_method() {
        let entity = ResolvableEntity::new(1, "Brian Boru");
        let candidate = Candidate::new("Q310", "Brian Boru");
        let results = vec![
            MatchResult::matched(&entity, &candidate, MatchMethod::Rule, 1.0, vec![]),
            MatchResult::matched(&entity, &candidate, MatchMethod::Llm, 0.8, vec![]),
            MatchResult::ambiguous(&entity),
            MatchResult::failed(&entity, "timeout"),
        ];
        let stats = MethodStats::from_results(&results);
        assert_eq!(stats.rule, 1);
        assert_eq!(stats.llm, 1);
        assert_eq!(stats.ambiguous, 1);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.matched(), 2);
    }

    #[test]
    fn test_validate_catches_disagreeing_counters() {
        let mut state = CheckpointState::empty(2);
        assert!(state.validate().is_ok());

        state.result_chunks = 2;
        state.chunk_sizes = vec![2, 1];
        state.total_results = 3;
        state.last_offset = 3;
        state.stats.total = 3;
        assert!(state.validate().is_ok());
        assert_eq!(state.chunk_start(1), 2);

        state.last_offset = 4;
        assert!(state.validate().is_err());
        state.last_offset = 3;
        state.chunk_sizes = vec![3, 0];
        assert!(state.validate().is_err());
    }
}
