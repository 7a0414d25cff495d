use anyhow::Result;

use crate::entity::normalizer::fuzzy_key;
use crate::entity::{Candidate, ResolvableEntity};

pub const NGRAM_DIMENSIONS: usize = 256;
const WORD_WEIGHT: f32 = 2.0;
const TRIGRAM_WEIGHT: f32 = 1.0;

/// Produces a fixed-size vector for a piece of text. Must be pure and deterministic.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Text embedded for a local entity: its name plus its description.
pub fn entity_text(entity: &ResolvableEntity) -> String {
    match entity.description.as_deref().map(str::trim) {
        Some(description) if !description.is_empty() => {
            format!("{}. {}", entity.display_name, description)
        }
        _ => entity.display_name.clone(),
    }
}

/// Text embedded for a candidate: its name plus its description.
pub fn candidate_text(candidate: &Candidate) -> String {
    if candidate.description.trim().is_empty() {
        candidate.display_name.clone()
    } else {
        format!("{}. {}", candidate.display_name, candidate.description)
    }
}

/// Calculate cosine similarity directly between two vectors
pub fn cosine_similarity(vec1: &[f32], vec2: &[f32]) -> Result<f32> {
    if vec1.len() != vec2.len() {
        return Err(anyhow::anyhow!(
            "Vector dimensions don't match: {} vs {}",
            vec1.len(),
            vec2.len()
        ));
    }

    let mag1: f32 = vec1.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag2: f32 = vec2.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag1 < 0.001 || mag2 < 0.001 {
        return Err(anyhow::anyhow!("Zero magnitude vector detected"));
    }

    let dot_product: f32 = vec1.iter().zip(vec2.iter()).map(|(a, b)| a * b).sum();
    Ok((dot_product / (mag1 * mag2)).clamp(-1.0, 1.0))
}

/// Hashed bag of words and character trigrams, L2-normalized.
///
/// Runs locally with no model download, so the embedding stage stays a pure
/// computation like the rule and fuzzy stages.
#[derive(Debug, Clone)]
pub struct NgramEmbedder {
    dimensions: usize,
}

impl Default for NgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: NGRAM_DIMENSIONS,
        }
    }
}

impl NgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let index = (hash % self.dimensions as u64) as usize;
        // The high bit picks the sign so colliding features tend to cancel out.
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Embedder for NgramEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = fuzzy_key(text);
        if key.is_empty() {
            return Err(anyhow::anyhow!("Cannot embed empty text"));
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for word in key.split_whitespace() {
            self.add_feature(&mut vector, &format!("w:{}", word), WORD_WEIGHT);
            let padded: Vec<char> = format!(" {} ", word).chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, &trigram, TRIGRAM_WEIGHT);
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            return Err(anyhow::anyhow!("Embedding collapsed to zero for '{}'", text));
        }
        vector.iter_mut().for_each(|x| *x /= norm);
        Ok(vector)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = [1.0, 0.0, 1.0];
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).unwrap().abs() < 1e-6);
        assert!(cosine_similarity(&a, &[1.0, 0.0]).is_err());
        assert!(cosine_similarity(&a, &[0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_ngram_embedder_is_deterministic_and_normalized() {
        let embedder = NgramEmbedder::default();
        let first = embedder.embed("Brian Boru. High King of Ireland").unwrap();
        let second = embedder.embed("Brian Boru. High King of Ireland").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), NGRAM_DIMENSIONS);
        let norm: f32 = first.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_related_text_scores_higher_than_unrelated() {
        let embedder = NgramEmbedder::default();
        let local = embedder.embed("Brian Boru. High King of Ireland").unwrap();
        let related = embedder.embed("Brian Bórumha. High King of Ireland").unwrap();
        let unrelated = embedder.embed("Grace O'Malley. pirate queen of Umaill").unwrap();
        let related_score = cosine_similarity(&local, &related).unwrap();
        let unrelated_score = cosine_similarity(&local, &unrelated).unwrap();
        assert!(related_score > unrelated_score);
    }

    #[test]
    fn test_entity_text_includes_description() {
        let entity = ResolvableEntity::new(1, "Brian Boru").with_description("High King");
        assert_eq!(entity_text(&entity), "Brian Boru. High King");
        assert_eq!(candidate_text(&Candidate::new("Q1", "Brian Boru")), "Brian Boru");
    }

    #[test]
    fn test_empty_text_is_rejected() {
        assert!(NgramEmbedder::default().embed(" .. ").is_err());
    }
}
