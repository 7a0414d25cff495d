use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Place,
    Event,
    #[default]
    Other,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Person => write!(f, "person"),
            EntityKind::Place => write!(f, "place"),
            EntityKind::Event => write!(f, "event"),
            EntityKind::Other => write!(f, "other"),
        }
    }
}

impl From<&str> for EntityKind {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "person" | "people" => EntityKind::Person,
            "place" | "location" => EntityKind::Place,
            "event" => EntityKind::Event,
            _ => EntityKind::Other,
        }
    }
}

/// Start/end years of an entity: birth/death for people, start/end for events.
///
/// Negative values are years BCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemporalBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i32>,
}

impl TemporalBounds {
    pub fn new(start: Option<i32>, end: Option<i32>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

impl fmt::Display for TemporalBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let year = |y: Option<i32>| y.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string());
        write!(f, "{}-{}", year(self.start), year(self.end))
    }
}

/// A local entity awaiting reconciliation. Owned by the entity store; read only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvableEntity {
    pub local_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub bounds: TemporalBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl ResolvableEntity {
    pub fn new(local_id: i64, display_name: &str) -> Self {
        ResolvableEntity {
            local_id,
            display_name: display_name.to_string(),
            kind: EntityKind::Other,
            description: None,
            bounds: TemporalBounds::default(),
            external_id: None,
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_bounds(mut self, start: Option<i32>, end: Option<i32>) -> Self {
        self.bounds = TemporalBounds::new(start, end);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// An external reference record returned by a candidate source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub external_id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub bounds: TemporalBounds,
}

impl Candidate {
    pub fn new(external_id: &str, display_name: &str) -> Self {
        Candidate {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            description: String::new(),
            aliases: Vec::new(),
            bounds: TemporalBounds::default(),
        }
    }

    /// Adds aliases in order, skipping blanks and repeats.
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for alias in aliases {
            self.push_alias(alias.as_ref());
        }
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_bounds(mut self, start: Option<i32>, end: Option<i32>) -> Self {
        self.bounds = TemporalBounds::new(start, end);
        self
    }

    pub fn push_alias(&mut self, alias: &str) {
        let alias = alias.trim();
        if alias.is_empty() || alias == self.display_name {
            return;
        }
        if !self.aliases.iter().any(|existing| existing == alias) {
            self.aliases.push(alias.to_string());
        }
    }

    /// Primary name followed by every alias.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.display_name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Candidates missing an id or a name are excluded from scoring.
    pub fn is_well_formed(&self) -> bool {
        !self.external_id.trim().is_empty() && !self.display_name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Rule,
    Fuzzy,
    Embedding,
    Llm,
    None,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Rule => "rule",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::Embedding => "embedding",
            MatchMethod::Llm => "llm",
            MatchMethod::None => "none",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of the matching cascade for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchDecision {
    Matched,
    Ambiguous,
    Unmatched,
}

/// Outcome of matching a single local entity. Exactly one per processed entity per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub local_id: i64,
    pub local_name: String,
    #[serde(default)]
    pub local_bounds: TemporalBounds,
    pub matched_external_id: Option<String>,
    pub matched_name: Option<String>,
    pub confidence: f64,
    pub method: MatchMethod,
    pub decision: MatchDecision,
    #[serde(default)]
    pub alias_evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MatchResult {
    pub fn matched(
        entity: &ResolvableEntity,
        candidate: &Candidate,
        method: MatchMethod,
        confidence: f64,
        alias_evidence: Vec<String>,
    ) -> Self {
        let confidence = match method {
            MatchMethod::Rule => 1.0,
            _ => confidence.clamp(0.0, 1.0),
        };
        MatchResult {
            local_id: entity.local_id,
            local_name: entity.display_name.clone(),
            local_bounds: entity.bounds,
            matched_external_id: Some(candidate.external_id.clone()),
            matched_name: Some(candidate.display_name.clone()),
            confidence,
            method,
            decision: MatchDecision::Matched,
            alias_evidence,
            rationale: None,
            error: None,
        }
    }

    pub fn unmatched(entity: &ResolvableEntity) -> Self {
        MatchResult {
            local_id: entity.local_id,
            local_name: entity.display_name.clone(),
            local_bounds: entity.bounds,
            matched_external_id: None,
            matched_name: None,
            confidence: 0.0,
            method: MatchMethod::None,
            decision: MatchDecision::Unmatched,
            alias_evidence: Vec::new(),
            rationale: None,
            error: None,
        }
    }

    pub fn ambiguous(entity: &ResolvableEntity) -> Self {
        MatchResult {
            decision: MatchDecision::Ambiguous,
            ..Self::unmatched(entity)
        }
    }

    /// Unmatched outcome caused by a transient failure; picked up by `retry-failed`.
    pub fn failed(entity: &ResolvableEntity, error: impl Into<String>) -> Self {
        MatchResult {
            error: Some(error.into()),
            ..Self::unmatched(entity)
        }
    }

    pub fn with_rationale(mut self, rationale: Option<String>) -> Self {
        self.rationale = rationale.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn is_matched(&self) -> bool {
        self.decision == MatchDecision::Matched && self.matched_external_id.is_some()
    }
}

/// Why an entity sits in the deferred adjudication queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// Borderline, but adjudication was skipped for this run.
    Skipped,
    /// The adjudicator could not decide.
    Uncertain,
    /// The adjudication call itself failed.
    AdjudicationFailed,
}

/// A borderline entity deferred to a separate adjudication pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAdjudication {
    pub local_id: i64,
    pub local_name: String,
    pub candidate_ids: Vec<String>,
    pub reason: PendingReason,
}
