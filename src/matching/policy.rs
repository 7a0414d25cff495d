use serde::{Deserialize, Serialize};

/// The single threshold table every stage of the cascade reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Fuzzy score at or above which a candidate is accepted outright.
    pub fuzzy_accept: f64,
    /// Embedding cosine similarity at or above which a candidate is accepted.
    pub embedding_accept: f64,
    /// Best fuzzy/embedding score an entity needs before adjudication is worth paying for.
    /// Anything lower is a clear rejection.
    pub adjudication_floor: f64,
    /// Largest tolerated difference, in years, on any end of the temporal bounds.
    pub temporal_tolerance_years: i32,
    /// Candidates shown to the adjudicator.
    pub adjudication_top_k: usize,
    /// Adjudicator acceptances below this certainty are treated as uncertain.
    pub llm_min_certainty: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            fuzzy_accept: 0.92,
            embedding_accept: 0.85,
            adjudication_floor: 0.70,
            temporal_tolerance_years: 5,
            adjudication_top_k: 3,
            llm_min_certainty: 0.5,
        }
    }
}
