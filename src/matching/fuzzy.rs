use std::collections::HashSet;
use strsim::jaro_winkler;

use crate::entity::normalizer::{fuzzy_key, token_sorted_key};
use crate::entity::Candidate;

// A token-subset match needs at least this many characters of shared evidence,
// otherwise "Aed" would match every "Aed <epithet>".
const SUBSET_MIN_CHARS: usize = 5;
const SUBSET_BASE: f64 = 0.88;
const SUBSET_SPAN: f64 = 0.12;

/// Best score of a local name against a candidate's name and aliases.
#[derive(Debug, Clone, PartialEq)]
pub struct NameScore {
    pub score: f64,
    /// The candidate name or alias that produced the score.
    pub evidence: String,
}

/// Similarity in [0, 1] between two names: the best of token-sorted
/// Jaro-Winkler, trigram Jaccard and token-subset coverage.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let sorted_a = token_sorted_key(a);
    let sorted_b = token_sorted_key(b);
    if sorted_a.is_empty() || sorted_b.is_empty() {
        return 0.0;
    }
    if sorted_a == sorted_b {
        return 1.0;
    }

    let jw = jaro_winkler(&sorted_a, &sorted_b);
    let trigram = trigram_jaccard(&sorted_a, &sorted_b);
    let subset = token_subset_score(a, b);
    jw.max(trigram).max(subset)
}

pub fn best_name_score(local_name: &str, candidate: &Candidate) -> NameScore {
    let mut best = NameScore {
        score: 0.0,
        evidence: candidate.display_name.clone(),
    };
    for name in candidate.names() {
        let score = name_similarity(local_name, name);
        if score > best.score {
            best = NameScore {
                score,
                evidence: name.to_string(),
            };
        }
    }
    best
}

fn trigrams(key: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = format!("  {} ", key).chars().collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Jaccard overlap of padded character trigrams.
pub fn trigram_jaccard(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

/// Rewards a name whose every token appears in the other ("Diarmuid" within
/// "Diarmuid Ua Duibhne"), scaled by how much of the longer name it covers.
pub fn token_subset_score(a: &str, b: &str) -> f64 {
    let key_a = fuzzy_key(a);
    let key_b = fuzzy_key(b);
    let tokens_a: HashSet<&str> = key_a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = key_b.split_whitespace().collect();

    let chars = |tokens: &HashSet<&str>| tokens.iter().map(|t| t.chars().count()).sum::<usize>();
    let (short, long) = if chars(&tokens_a) <= chars(&tokens_b) {
        (&tokens_a, &tokens_b)
    } else {
        (&tokens_b, &tokens_a)
    };

    let short_chars = chars(short);
    let long_chars = chars(long);
    if short.is_empty() || short_chars < SUBSET_MIN_CHARS || !short.is_subset(long) {
        return 0.0;
    }
    SUBSET_BASE + SUBSET_SPAN * (short_chars as f64 / long_chars as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_after_normalization() {
        assert_eq!(name_similarity("Gráinne Mhaol", "grainne  mhaol"), 1.0);
        assert_eq!(name_similarity("Ó Néill, Aodh", "Aodh Ó Néill"), 1.0);
    }

    #[test]
    fn test_given_name_inside_full_name() {
        let score = name_similarity("Diarmuid", "Diarmuid Ua Duibhne");
        assert!(score >= 0.92, "score was {}", score);
        assert!((score - 0.93).abs() < 0.02, "score was {}", score);
    }

    #[test]
    fn test_short_tokens_do_not_count_as_subset() {
        assert_eq!(token_subset_score("Aed", "Aed Oirdnide"), 0.0);
        assert!(name_similarity("Aed", "Aed Oirdnide") < 0.92);
    }

    #[test]
    fn test_unrelated_names_score_low() {
        assert!(name_similarity("Brian Boru", "Grace O'Malley") < 0.6);
        assert_eq!(name_similarity("", "Brian Boru"), 0.0);
    }

    #[test]
    fn test_best_score_uses_aliases() {
        let candidate = Candidate::new("Q1", "Fionn mac Cumhaill").with_aliases(["Finn McCool"]);
        let best = best_name_score("Finn MacCool", &candidate);
        assert_eq!(best.evidence, "Finn McCool");
        assert!(best.score > 0.9);
    }

    #[test]
    fn test_trigram_jaccard_bounds() {
        assert_eq!(trigram_jaccard("abc", "abc"), 1.0);
        assert_eq!(trigram_jaccard("abc", "xyz"), 0.0);
    }
}
