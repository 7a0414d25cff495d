pub mod adjudication;
pub mod embedding;
pub mod fuzzy;
pub mod policy;
pub mod temporal;

use std::cmp::{Ordering, Reverse};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::entity::normalizer::exact_key;
use crate::entity::{
    Candidate, MatchMethod, MatchResult, PendingAdjudication, PendingReason, ResolvableEntity,
};
use crate::TARGET_MATCHING;

pub use adjudication::{
    parse_verdict, Adjudicator, ScriptedAdjudicator, Verdict, VerdictDecision,
};
pub use embedding::{cosine_similarity, Embedder, NgramEmbedder};
pub use policy::MatchPolicy;

use embedding::{candidate_text, entity_text};
use fuzzy::best_name_score;
use temporal::{bounds_conflict, temporal_distance};

// Scores closer than this are treated as equal when breaking ties.
const SCORE_EPSILON: f64 = 1e-9;

/// Final result for one entity plus, for borderline entities, its place in the
/// deferred adjudication queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub result: MatchResult,
    pub pending: Option<PendingAdjudication>,
}

impl MatchOutcome {
    fn decided(result: MatchResult) -> Self {
        Self {
            result,
            pending: None,
        }
    }
}

/// Outcome of the deterministic stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Screening {
    Decided(MatchResult),
    /// Close enough to be worth adjudicating; candidates best first, at most top-k.
    Borderline { shortlist: Vec<Candidate> },
}

#[derive(Debug, Clone)]
struct Scored<'a> {
    candidate: &'a Candidate,
    score: f64,
    evidence: String,
    distance: Option<i32>,
}

impl Scored<'_> {
    // Closer in time first (unknown distance last), then better attested.
    fn tie_key(&self) -> (bool, i32, Reverse<usize>) {
        (
            self.distance.is_none(),
            self.distance.unwrap_or(i32::MAX),
            Reverse(self.candidate.aliases.len()),
        )
    }
}

/// Result of selecting a winner at one stage.
enum Selection<'a, 'b> {
    Winner(&'b Scored<'a>),
    /// Several candidates tied on score, temporal distance and alias count.
    Tied,
    NoneAccepted,
}

fn select_best<'a, 'b>(scored: &'b [Scored<'a>], threshold: f64) -> Selection<'a, 'b> {
    let best_score = scored
        .iter()
        .map(|s| s.score)
        .fold(f64::NEG_INFINITY, f64::max);
    if best_score < threshold {
        return Selection::NoneAccepted;
    }

    let top: Vec<&Scored> = scored
        .iter()
        .filter(|s| (best_score - s.score).abs() <= SCORE_EPSILON)
        .collect();
    let best_key = top.iter().map(|s| s.tie_key()).min();
    let winners: Vec<&Scored> = top
        .into_iter()
        .filter(|s| Some(s.tie_key()) == best_key)
        .collect();

    match winners.as_slice() {
        [winner] => Selection::Winner(*winner),
        [] => Selection::NoneAccepted,
        _ => Selection::Tied,
    }
}

/// Staged matching cascade: rule, fuzzy, embedding, then adjudication for
/// borderline entities only.
#[derive(Clone)]
pub struct Matcher {
    policy: MatchPolicy,
    embedder: Option<Arc<dyn Embedder>>,
    adjudicator: Option<Arc<dyn Adjudicator>>,
}

impl Matcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            embedder: None,
            adjudicator: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_adjudicator(mut self, adjudicator: Arc<dyn Adjudicator>) -> Self {
        self.adjudicator = Some(adjudicator);
        self
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    pub fn has_adjudicator(&self) -> bool {
        self.adjudicator.is_some()
    }

    /// Validates, de-duplicates and temporally filters the candidate list.
    ///
    /// The returned order depends only on candidate content, never on input order.
    fn eligible(&self, entity: &ResolvableEntity, candidates: &[Candidate]) -> Vec<Candidate> {
        let mut eligible: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.is_well_formed())
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.external_id
                .cmp(&b.external_id)
                .then_with(|| b.aliases.len().cmp(&a.aliases.len()))
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.description.cmp(&b.description))
                .then_with(|| a.bounds.start.cmp(&b.bounds.start))
                .then_with(|| a.bounds.end.cmp(&b.bounds.end))
        });
        eligible.dedup_by(|later, earlier| later.external_id == earlier.external_id);

        eligible.retain(|candidate| {
            let conflict = bounds_conflict(
                &entity.bounds,
                &candidate.bounds,
                self.policy.temporal_tolerance_years,
            );
            if conflict {
                debug!(
                    target: TARGET_MATCHING,
                    "Disqualified {} for '{}': bounds {} vs local {}",
                    candidate.external_id, entity.display_name, candidate.bounds, entity.bounds
                );
            }
            !conflict
        });
        eligible
    }

    fn scored<'a>(
        &self,
        entity: &ResolvableEntity,
        candidates: &'a [Candidate],
        score: impl Fn(&Candidate) -> (f64, String),
    ) -> Vec<Scored<'a>> {
        candidates
            .iter()
            .map(|candidate| {
                let (score, evidence) = score(candidate);
                Scored {
                    candidate,
                    score,
                    evidence,
                    distance: temporal_distance(&entity.bounds, &candidate.bounds),
                }
            })
            .collect()
    }

    fn embedding_scores(&self, entity: &ResolvableEntity, candidates: &[Candidate]) -> Option<Vec<f64>> {
        let embedder = self.embedder.as_ref()?;
        let local = match embedder.embed(&entity_text(entity)) {
            Ok(vector) => vector,
            Err(e) => {
                warn!(
                    target: TARGET_MATCHING,
                    "Skipping embedding stage for '{}': {}", entity.display_name, e
                );
                return None;
            }
        };

        let scores = candidates
            .iter()
            .map(|candidate| {
                embedder
                    .embed(&candidate_text(candidate))
                    .and_then(|vector| cosine_similarity(&local, &vector))
                    .map(|similarity| f64::from(similarity.max(0.0)))
                    .unwrap_or_else(|e| {
                        debug!(
                            target: TARGET_MATCHING,
                            "No embedding score for {}: {}", candidate.external_id, e
                        );
                        0.0
                    })
            })
            .collect();
        Some(scores)
    }

    /// Runs the deterministic stages. Pure: the same entity and candidate set
    /// always produce the same screening, whatever the candidate order.
    pub fn screen(&self, entity: &ResolvableEntity, candidates: &[Candidate]) -> Screening {
        let eligible = self.eligible(entity, candidates);
        if eligible.is_empty() {
            return Screening::Decided(MatchResult::unmatched(entity));
        }

        let mut unresolved_tie = false;

        // Rule: a known external id, or exact name/alias equality.
        if let Some(known) = entity.external_id.as_deref() {
            if let Some(candidate) = eligible.iter().find(|c| c.external_id == known) {
                return Screening::Decided(MatchResult::matched(
                    entity,
                    candidate,
                    MatchMethod::Rule,
                    1.0,
                    vec![candidate.display_name.clone()],
                ));
            }
        }
        let local_key = exact_key(&entity.display_name);
        let rule_scored = self.scored(entity, &eligible, |candidate| {
            match candidate.names().find(|name| exact_key(name) == local_key) {
                Some(name) if !local_key.is_empty() => (1.0, name.to_string()),
                _ => (0.0, String::new()),
            }
        });
        match select_best(&rule_scored, 1.0) {
            Selection::Winner(winner) => {
                return Screening::Decided(MatchResult::matched(
                    entity,
                    winner.candidate,
                    MatchMethod::Rule,
                    1.0,
                    vec![winner.evidence.clone()],
                ))
            }
            Selection::Tied => unresolved_tie = true,
            Selection::NoneAccepted => {}
        }

        let fuzzy_scored = self.scored(entity, &eligible, |candidate| {
            let best = best_name_score(&entity.display_name, candidate);
            (best.score, best.evidence)
        });
        match select_best(&fuzzy_scored, self.policy.fuzzy_accept) {
            Selection::Winner(winner) => {
                return Screening::Decided(MatchResult::matched(
                    entity,
                    winner.candidate,
                    MatchMethod::Fuzzy,
                    winner.score,
                    vec![winner.evidence.clone()],
                ))
            }
            Selection::Tied => unresolved_tie = true,
            Selection::NoneAccepted => {}
        }

        let embedding = self.embedding_scores(entity, &eligible);
        let embedding_scored = embedding.as_ref().map(|scores| {
            let mut scored = self.scored(entity, &eligible, |_| (0.0, String::new()));
            for (entry, score) in scored.iter_mut().zip(scores) {
                entry.score = *score;
                entry.evidence = best_name_score(&entity.display_name, entry.candidate).evidence;
            }
            scored
        });
        if let Some(scored) = embedding_scored.as_ref() {
            match select_best(scored, self.policy.embedding_accept) {
                Selection::Winner(winner) => {
                    return Screening::Decided(MatchResult::matched(
                        entity,
                        winner.candidate,
                        MatchMethod::Embedding,
                        winner.score,
                        vec![winner.evidence.clone()],
                    ))
                }
                Selection::Tied => unresolved_tie = true,
                Selection::NoneAccepted => {}
            }
        }

        // Borderline: combine both scores per candidate and keep the best top-k.
        let mut combined: Vec<Scored> = fuzzy_scored.clone();
        if let Some(scored) = embedding_scored.as_ref() {
            for (entry, embedded) in combined.iter_mut().zip(scored) {
                entry.score = entry.score.max(embedded.score);
            }
        }
        let best_score = combined.iter().map(|s| s.score).fold(0.0, f64::max);
        if !unresolved_tie && best_score < self.policy.adjudication_floor {
            debug!(
                target: TARGET_MATCHING,
                "No match for '{}' (best score {:.3})", entity.display_name, best_score
            );
            return Screening::Decided(MatchResult::unmatched(entity));
        }

        combined.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.tie_key().cmp(&b.tie_key()))
                .then_with(|| a.candidate.external_id.cmp(&b.candidate.external_id))
        });
        let shortlist = combined
            .iter()
            .take(self.policy.adjudication_top_k.max(1))
            .map(|s| s.candidate.clone())
            .collect();
        Screening::Borderline { shortlist }
    }

    /// Resolves one entity. Only borderline entities reach the adjudicator, and
    /// only when `skip_adjudication` is false.
    pub async fn resolve(
        &self,
        entity: &ResolvableEntity,
        candidates: &[Candidate],
        skip_adjudication: bool,
    ) -> MatchOutcome {
        let shortlist = match self.screen(entity, candidates) {
            Screening::Decided(result) => return MatchOutcome::decided(result),
            Screening::Borderline { shortlist } => shortlist,
        };

        match self.adjudicator.as_ref() {
            Some(adjudicator) if !skip_adjudication => {
                self.adjudicate(adjudicator.as_ref(), entity, &shortlist).await
            }
            _ => MatchOutcome {
                result: MatchResult::ambiguous(entity),
                pending: Some(pending_for(entity, &shortlist, PendingReason::Skipped)),
            },
        }
    }

    async fn adjudicate(
        &self,
        adjudicator: &dyn Adjudicator,
        entity: &ResolvableEntity,
        shortlist: &[Candidate],
    ) -> MatchOutcome {
        let verdict = match adjudicator.adjudicate(entity, shortlist).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(
                    target: TARGET_MATCHING,
                    "Adjudication failed for '{}': {}", entity.display_name, e
                );
                return MatchOutcome {
                    result: MatchResult::ambiguous(entity).with_error(Some(e.to_string())),
                    pending: Some(pending_for(entity, shortlist, PendingReason::AdjudicationFailed)),
                };
            }
        };

        let rationale = Some(verdict.rationale.clone());
        match verdict.decision {
            VerdictDecision::Accept => {
                let accepted = verdict
                    .external_id
                    .as_deref()
                    .and_then(|id| shortlist.iter().find(|c| c.external_id == id));
                match accepted {
                    Some(candidate) if verdict.certainty >= self.policy.llm_min_certainty => {
                        let evidence = best_name_score(&entity.display_name, candidate).evidence;
                        MatchOutcome::decided(
                            MatchResult::matched(
                                entity,
                                candidate,
                                MatchMethod::Llm,
                                verdict.certainty,
                                vec![evidence],
                            )
                            .with_rationale(rationale),
                        )
                    }
                    _ => {
                        debug!(
                            target: TARGET_MATCHING,
                            "Treating acceptance of {:?} (certainty {:.2}) for '{}' as uncertain",
                            verdict.external_id, verdict.certainty, entity.display_name
                        );
                        MatchOutcome {
                            result: MatchResult::ambiguous(entity).with_rationale(rationale),
                            pending: Some(pending_for(entity, shortlist, PendingReason::Uncertain)),
                        }
                    }
                }
            }
            VerdictDecision::Reject => {
                MatchOutcome::decided(MatchResult::unmatched(entity).with_rationale(rationale))
            }
            VerdictDecision::Uncertain => MatchOutcome {
                result: MatchResult::ambiguous(entity).with_rationale(rationale),
                pending: Some(pending_for(entity, shortlist, PendingReason::Uncertain)),
            },
        }
    }
}

fn pending_for(
    entity: &ResolvableEntity,
    shortlist: &[Candidate],
    reason: PendingReason,
) -> PendingAdjudication {
    PendingAdjudication {
        local_id: entity.local_id,
        local_name: entity.display_name.clone(),
        candidate_ids: shortlist.iter().map(|c| c.external_id.clone()).collect(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MatchDecision;
    use crate::remote::RemoteError;

    fn matcher() -> Matcher {
        Matcher::new(MatchPolicy::default())
    }

    fn scripted(verdicts: Vec<Result<Verdict, RemoteError>>) -> (Matcher, Arc<ScriptedAdjudicator>) {
        let adjudicator = Arc::new(ScriptedAdjudicator::new(verdicts));
        let matcher = matcher().with_adjudicator(adjudicator.clone());
        (matcher, adjudicator)
    }

    /// Maps any text mentioning Ulster to one axis and everything else to another.
    struct KeywordEmbedder;

    impl Embedder for KeywordEmbedder {
        fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            if text.contains("Ulster") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    fn borderline_entity() -> ResolvableEntity {
        ResolvableEntity::new(7, "Aed")
    }

    fn borderline_candidates() -> Vec<Candidate> {
        vec![Candidate::new("Q1", "Aed Oirdnide").with_bounds(Some(770), Some(819))]
    }

    #[tokio::test]
    async fn test_exact_alias_is_rule_match() {
        let entity = ResolvableEntity::new(1, "fionn  MAC cumhaill");
        let candidates = vec![
            Candidate::new("Q2", "Finn McCool").with_aliases(["Fionn mac Cumhaill"]),
            Candidate::new("Q3", "Fingal Rónáin"),
        ];
        let outcome = matcher().resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.decision, MatchDecision::Matched);
        assert_eq!(outcome.result.method, MatchMethod::Rule);
        assert_eq!(outcome.result.confidence, 1.0);
        assert_eq!(outcome.result.matched_external_id.as_deref(), Some("Q2"));
        assert_eq!(outcome.result.alias_evidence, vec!["Fionn mac Cumhaill"]);
        assert!(outcome.pending.is_none());
    }

    #[tokio::test]
    async fn test_known_external_id_is_rule_match() {
        let mut entity = ResolvableEntity::new(1, "Ard Rí Brian");
        entity.external_id = Some("Q310".to_string());
        let candidates = vec![Candidate::new("Q310", "Brian Boru"), Candidate::new("Q9", "Brian")];
        let outcome = matcher().resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.method, MatchMethod::Rule);
        assert_eq!(outcome.result.matched_external_id.as_deref(), Some("Q310"));
    }

    #[tokio::test]
    async fn test_given_name_is_fuzzy_match() {
        let entity = ResolvableEntity::new(2, "Diarmuid");
        let candidates = vec![Candidate::new("Q5", "Diarmuid Ua Duibhne")];
        let outcome = matcher().resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.decision, MatchDecision::Matched);
        assert_eq!(outcome.result.method, MatchMethod::Fuzzy);
        assert!((outcome.result.confidence - 0.93).abs() < 0.02);
        assert!(outcome.result.confidence >= MatchPolicy::default().fuzzy_accept);
    }

    #[tokio::test]
    async fn test_temporal_conflict_disqualifies_exact_name() {
        let entity = ResolvableEntity::new(3, "Joan of Arc").with_bounds(Some(1412), Some(1431));
        let candidates = vec![Candidate::new("Q7226", "Joan of Arc").with_bounds(Some(1200), None)];
        let (matcher, adjudicator) = scripted(vec![Ok(Verdict::accept("Q7226", 0.99, "same name"))]);

        let outcome = matcher.resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.decision, MatchDecision::Unmatched);
        assert_eq!(outcome.result.method, MatchMethod::None);
        assert_eq!(outcome.result.confidence, 0.0);
        assert_eq!(adjudicator.calls(), 0);
    }

    #[tokio::test]
    async fn test_one_end_off_keeps_exact_name_eligible() {
        let entity = ResolvableEntity::new(3, "Joan of Arc").with_bounds(Some(1412), Some(1431));
        let candidates = vec![Candidate::new("Q7226", "Joan of Arc").with_bounds(Some(1412), Some(1440))];
        let outcome = matcher().resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.decision, MatchDecision::Matched);
        assert_eq!(outcome.result.method, MatchMethod::Rule);
        assert_eq!(outcome.result.matched_external_id.as_deref(), Some("Q7226"));
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_every_stage() {
        let (matcher, adjudicator) = scripted(vec![]);
        let outcome = matcher
            .resolve(&ResolvableEntity::new(4, "Niall Noígíallach"), &[], false)
            .await;
        assert_eq!(outcome.result.decision, MatchDecision::Unmatched);
        assert!(outcome.pending.is_none());
        assert_eq!(adjudicator.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_candidates_are_ignored() {
        let entity = ResolvableEntity::new(4, "Brian Boru");
        let candidates = vec![Candidate::new("", "Brian Boru"), Candidate::new("Q1", " ")];
        let outcome = matcher().resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.decision, MatchDecision::Unmatched);
    }

    #[test]
    fn test_tie_break_prefers_closer_dates_in_any_order() {
        let entity = ResolvableEntity::new(5, "Brian Boru").with_bounds(Some(941), Some(1014));
        let close = Candidate::new("Q310", "Brian Boru").with_bounds(Some(941), Some(1014));
        let undated = Candidate::new("Q311", "Brian Boru").with_aliases(["Brian Bóruma"]);
        let matcher = matcher();

        for candidates in [
            vec![close.clone(), undated.clone()],
            vec![undated.clone(), close.clone()],
        ] {
            match matcher.screen(&entity, &candidates) {
                Screening::Decided(result) => {
                    assert_eq!(result.matched_external_id.as_deref(), Some("Q310"));
                }
                other => panic!("expected a decision, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_tie_break_then_prefers_more_aliases() {
        let entity = ResolvableEntity::new(5, "Brian Boru");
        let plain = Candidate::new("Q1", "Brian Boru");
        let attested = Candidate::new("Q2", "Brian Boru").with_aliases(["Brian Bóruma", "Brian mac Cennétig"]);
        let result = match matcher().screen(&entity, &[plain, attested]) {
            Screening::Decided(result) => result,
            other => panic!("expected a decision, got {:?}", other),
        };
        assert_eq!(result.matched_external_id.as_deref(), Some("Q2"));
    }

    #[tokio::test]
    async fn test_full_tie_is_deferred_not_guessed() {
        let entity = ResolvableEntity::new(6, "Brian Boru");
        let candidates = vec![Candidate::new("Q2", "Brian Boru"), Candidate::new("Q1", "Brian Boru")];
        let outcome = matcher().resolve(&entity, &candidates, true).await;
        assert_eq!(outcome.result.decision, MatchDecision::Ambiguous);
        let pending = outcome.pending.expect("tie should be queued");
        assert_eq!(pending.reason, PendingReason::Skipped);
        assert_eq!(pending.candidate_ids, vec!["Q1", "Q2"]);
    }

    #[test]
    fn test_duplicate_candidates_collapse() {
        let entity = ResolvableEntity::new(6, "Brian Boru");
        let candidates = vec![Candidate::new("Q1", "Brian Boru"), Candidate::new("Q1", "Brian Boru")];
        assert!(matches!(matcher().screen(&entity, &candidates), Screening::Decided(r) if r.is_matched()));
    }

    #[tokio::test]
    async fn test_embedding_stage_matches_on_description() {
        let entity = ResolvableEntity::new(8, "Setanta").with_description("hero of Ulster");
        let candidates = vec![
            Candidate::new("Q1", "Cú Chulainn").with_description("hero of Ulster"),
            Candidate::new("Q2", "Ferdiad").with_description("warrior of Connacht"),
        ];
        let matcher = matcher().with_embedder(Arc::new(KeywordEmbedder));
        let outcome = matcher.resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.method, MatchMethod::Embedding);
        assert_eq!(outcome.result.matched_external_id.as_deref(), Some("Q1"));
        assert!(outcome.result.confidence >= MatchPolicy::default().embedding_accept);
    }

    #[tokio::test]
    async fn test_clear_rejection_never_reaches_adjudicator() {
        let (matcher, adjudicator) = scripted(vec![Ok(Verdict::accept("Q1", 0.9, ""))]);
        let entity = ResolvableEntity::new(9, "Gráinne Ní Mháille");
        let candidates = vec![Candidate::new("Q1", "Battle of Kinsale")];
        let outcome = matcher.resolve(&entity, &candidates, false).await;
        assert_eq!(outcome.result.decision, MatchDecision::Unmatched);
        assert_eq!(adjudicator.calls(), 0);
    }

    #[tokio::test]
    async fn test_borderline_accept_is_llm_match() {
        let (matcher, adjudicator) =
            scripted(vec![Ok(Verdict::accept("Q1", 0.8, "same king of Tara"))]);
        let outcome = matcher
            .resolve(&borderline_entity(), &borderline_candidates(), false)
            .await;
        assert_eq!(adjudicator.calls(), 1);
        assert_eq!(outcome.result.method, MatchMethod::Llm);
        assert_eq!(outcome.result.confidence, 0.8);
        assert_eq!(outcome.result.rationale.as_deref(), Some("same king of Tara"));
        assert!(outcome.pending.is_none());
    }

    #[tokio::test]
    async fn test_borderline_skipped_is_queued() {
        let (matcher, adjudicator) = scripted(vec![]);
        let outcome = matcher
            .resolve(&borderline_entity(), &borderline_candidates(), true)
            .await;
        assert_eq!(adjudicator.calls(), 0);
        assert_eq!(outcome.result.decision, MatchDecision::Ambiguous);
        assert_eq!(outcome.pending.map(|p| p.reason), Some(PendingReason::Skipped));

        let without = self::matcher()
            .resolve(&borderline_entity(), &borderline_candidates(), false)
            .await;
        assert_eq!(without.pending.map(|p| p.reason), Some(PendingReason::Skipped));
    }

    #[tokio::test]
    async fn test_verdict_outcomes() {
        let cases = vec![
            (Ok(Verdict::reject("different era")), MatchDecision::Unmatched, None),
            (
                Ok(Verdict::uncertain("too little evidence")),
                MatchDecision::Ambiguous,
                Some(PendingReason::Uncertain),
            ),
            (
                Ok(Verdict::accept("Q1", 0.3, "maybe")),
                MatchDecision::Ambiguous,
                Some(PendingReason::Uncertain),
            ),
            (
                Ok(Verdict::accept("Q404", 0.95, "not on the list")),
                MatchDecision::Ambiguous,
                Some(PendingReason::Uncertain),
            ),
            (
                Err(RemoteError::Transient("timeout".to_string())),
                MatchDecision::Ambiguous,
                Some(PendingReason::AdjudicationFailed),
            ),
        ];

        for (verdict, decision, reason) in cases {
            let failed = verdict.is_err();
            let (matcher, _) = scripted(vec![verdict]);
            let outcome = matcher
                .resolve(&borderline_entity(), &borderline_candidates(), false)
                .await;
            assert_eq!(outcome.result.decision, decision);
            assert!(outcome.result.matched_external_id.is_none());
            assert_eq!(outcome.pending.as_ref().map(|p| p.reason), reason);
            assert_eq!(outcome.result.error.is_some(), failed);
        }
    }
}
