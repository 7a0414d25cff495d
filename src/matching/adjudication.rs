use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::entity::{Candidate, ResolvableEntity};
use crate::remote::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VerdictDecision {
    Accept,
    Reject,
    Uncertain,
}

/// The judgment returned for one borderline entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Verdict {
    pub decision: VerdictDecision,
    /// Id of the accepted candidate; required when `decision` is `accept`.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Model-reported certainty in [0, 1].
    #[serde(default)]
    pub certainty: f64,
    #[serde(default)]
    pub rationale: String,
}

impl Verdict {
    pub fn accept(external_id: &str, certainty: f64, rationale: &str) -> Self {
        Self {
            decision: VerdictDecision::Accept,
            external_id: Some(external_id.to_string()),
            certainty,
            rationale: rationale.to_string(),
        }
    }

    pub fn reject(rationale: &str) -> Self {
        Self {
            decision: VerdictDecision::Reject,
            external_id: None,
            certainty: 0.0,
            rationale: rationale.to_string(),
        }
    }

    pub fn uncertain(rationale: &str) -> Self {
        Self {
            decision: VerdictDecision::Uncertain,
            external_id: None,
            certainty: 0.0,
            rationale: rationale.to_string(),
        }
    }
}

/// Resolves a borderline entity against its shortlisted candidates.
///
/// Implementations are the only non-deterministic part of the cascade.
#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn adjudicate(
        &self,
        entity: &ResolvableEntity,
        candidates: &[Candidate],
    ) -> Result<Verdict, RemoteError>;
}

/// Parses a verdict out of a raw model response, tolerating code fences,
/// `<think>` sections and chatter around the JSON object.
pub fn parse_verdict(response: &str) -> Result<Verdict, RemoteError> {
    let without_thinking = match (response.find("<think>"), response.find("</think>")) {
        (Some(start), Some(end)) if end > start => {
            format!("{}{}", &response[..start], &response[end + "</think>".len()..])
        }
        _ => response.to_string(),
    };

    let start = without_thinking.find('{');
    let end = without_thinking.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &without_thinking[start..=end],
        _ => {
            return Err(RemoteError::Permanent(format!(
                "no JSON object in adjudication response: {}",
                without_thinking.chars().take(200).collect::<String>()
            )))
        }
    };

    let mut verdict: Verdict = serde_json::from_str(json)
        .map_err(|e| RemoteError::Permanent(format!("invalid adjudication JSON: {}", e)))?;
    verdict.certainty = if verdict.certainty.is_finite() {
        verdict.certainty.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(verdict)
}

/// Replays queued verdicts in order; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct ScriptedAdjudicator {
    verdicts: Mutex<VecDeque<Result<Verdict, RemoteError>>>,
    calls: AtomicUsize,
}

impl ScriptedAdjudicator {
    pub fn new<I>(verdicts: I) -> Self
    where
        I: IntoIterator<Item = Result<Verdict, RemoteError>>,
    {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adjudicator for ScriptedAdjudicator {
    async fn adjudicate(
        &self,
        _entity: &ResolvableEntity,
        _candidates: &[Candidate],
    ) -> Result<Verdict, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = match self.verdicts.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| Ok(Verdict::uncertain("no scripted verdict left")))
    }
}
