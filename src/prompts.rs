// prompts.rs

use crate::entity::{Candidate, ResolvableEntity};

fn describe_entity(entity: &ResolvableEntity) -> String {
    let mut lines = vec![format!("Name: {}", entity.display_name)];
    lines.push(format!("Kind: {}", entity.kind));
    if !entity.bounds.is_empty() {
        lines.push(format!("Dates: {}", entity.bounds));
    }
    if let Some(description) = entity.description.as_deref().filter(|d| !d.trim().is_empty()) {
        lines.push(format!("Description: {}", description.trim()));
    }
    lines.join("\n")
}

fn describe_candidate(candidate: &Candidate) -> String {
    let mut lines = vec![format!(
        "- id: {}\n  name: {}",
        candidate.external_id, candidate.display_name
    )];
    if !candidate.aliases.is_empty() {
        lines.push(format!("  also known as: {}", candidate.aliases.join("; ")));
    }
    if !candidate.bounds.is_empty() {
        lines.push(format!("  dates: {}", candidate.bounds));
    }
    if !candidate.description.trim().is_empty() {
        lines.push(format!("  description: {}", candidate.description.trim()));
    }
    lines.join("\n")
}

pub fn adjudication_prompt(entity: &ResolvableEntity, candidates: &[Candidate]) -> String {
    let candidate_block = candidates
        .iter()
        .map(describe_candidate)
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are reconciling a record from a historical archive against entries in a public
knowledge base. Decide whether the archive record refers to exactly one of the listed
entries.

Archive record:
{}

Knowledge base entries:
{}

Names alone are not enough: the dates and descriptions must not contradict each other. Spelling
variants, Irish and anglicized forms, and epithets of the same person are expected.

Respond with a single JSON object and nothing else:
{{\"decision\": \"accept\" | \"reject\" | \"uncertain\", \"external_id\": \"<id of the accepted entry, or null>\", \"certainty\": <number between 0 and 1>, \"rationale\": \"<one sentence>\"}}

Use \"accept\" only when one entry is clearly the same entity, \"reject\" when none of them is,
and \"uncertain\" when you cannot tell.",
        describe_entity(entity),
        candidate_block
    )
}
