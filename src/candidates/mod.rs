//! Candidate retrieval from a remote knowledge graph.

pub mod fixed;
pub mod wikidata;

use async_trait::async_trait;

use crate::entity::Candidate;

pub use fixed::StaticCandidateSource;
pub use wikidata::{WikidataConfig, WikidataSource};

/// Candidates for one query plus the failure that cut it short, if any.
///
/// A failed fetch is an empty, low-confidence outcome for the caller, never a fault.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateFetch {
    pub candidates: Vec<Candidate>,
    pub error: Option<String>,
}

impl CandidateFetch {
    pub fn found(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            candidates: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Plausible reference entities for `name`, in the remote service's relevance order.
    ///
    /// `hint` is optional disambiguating text (usually a year); sources may use it to
    /// reorder hits but must never drop every hit because of it.
    async fn fetch(&self, name: &str, hint: Option<&str>) -> CandidateFetch;
}

/// Stable partition: hits whose description mentions the hint move to the front.
pub(crate) fn promote_hinted(candidates: Vec<Candidate>, hint: Option<&str>) -> Vec<Candidate> {
    let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) else {
        return candidates;
    };
    let hint = hint.to_lowercase();
    let (mut hinted, rest): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| c.description.to_lowercase().contains(&hint));
    hinted.extend(rest);
    hinted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_promotes_without_dropping() {
        let candidates = vec![
            Candidate::new("Q1", "Brian").with_description("given name"),
            Candidate::new("Q2", "Brian Boru").with_description("High King of Ireland (d. 1014)"),
            Candidate::new("Q3", "Brian").with_description("1999 film"),
        ];

        let reordered = promote_hinted(candidates.clone(), Some("1014"));
        let ids: Vec<_> = reordered.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["Q2", "Q1", "Q3"]);

        let unchanged = promote_hinted(candidates.clone(), Some("1600"));
        assert_eq!(unchanged, candidates);
        assert_eq!(promote_hinted(candidates.clone(), None), candidates);
    }
}
