//! Question Generator Router (C6) — produces the next interviewer
//! question for a competency, gated by the current follow-up depth.
//!
//! Grounded on `original_source/flow_manager/agents/competency.py`
//! (`CompetencyAgent`/`CompetencyPlan`, the `_intro_text` question-index
//! branching, targeted-criteria propagation) with the persona-polish step
//! delegated to [`crate::persona`]. The "unknown-facet generic ladder" is
//! this engine's fallback when a facet carries no oracle-identifiable
//! focus — the original always had a concrete competency id to anchor on.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::llm::OracleAdapter;
use crate::persona::{self, Purpose};
use crate::session::{Competency, Question, QuestionMetadata};

/// Generic probes used when a facet can't be tied to a named criterion —
/// still on-topic, but not rubric-targeted.
const GENERIC_LADDER: [&str; 3] = [
    "Can you walk me through a specific example from your experience?",
    "What tradeoffs did you weigh when making that decision?",
    "How would you verify that approach works correctly in production?",
];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CompetencyPlan {
    pub persona_brief: String,
    pub draft_question: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub targeted_criteria: Vec<String>,
}

pub struct QuestionGenerator<'a> {
    adapter: &'a OracleAdapter,
    oracle_name: String,
}

impl<'a> QuestionGenerator<'a> {
    pub fn new(adapter: &'a OracleAdapter, oracle_name: impl Into<String>) -> Self {
        Self { adapter, oracle_name: oracle_name.into() }
    }

    /// Generate the next question for `competency`. `followup_index` is
    /// 0 for the opening question of an item, 1+ for deeper probes (I1).
    pub async fn generate(
        &self,
        competency: &Competency,
        item_id: &str,
        remaining_criteria: &[String],
        followup_index: u8,
        persona_name: &str,
    ) -> EngineResult<Question> {
        let intro = intro_text(followup_index, &competency.name);
        let prompt = format!(
            "{intro}\nCompetency: {}\nRemaining Criteria:\n{}\n\nReturn persona_brief, draft_question, tone, and targeted_criteria.",
            competency.name,
            format_criteria(remaining_criteria),
        );

        let plan = self
            .adapter
            .call::<CompetencyPlan>(&self.oracle_name, Vec::new(), vec![prompt])
            .await
            .unwrap_or_else(|_| CompetencyPlan {
                persona_brief: String::new(),
                draft_question: String::new(),
                tone: "neutral".to_string(),
                targeted_criteria: Vec::new(),
            });

        let draft = plan.draft_question.trim();
        let facet_known = !remaining_criteria.is_empty();
        let core_text = if !draft.is_empty() {
            draft.to_string()
        } else if facet_known {
            format!("Can you walk me through your approach to {}?", competency.name)
        } else {
            generic_probe(followup_index)
        };

        let styled = persona::apply_persona(&core_text, persona_name, Purpose::AskQuestion, 2);

        let targeted: Vec<String> = plan.targeted_criteria.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let facet_id = targeted.first().cloned().unwrap_or_else(|| "general".to_string());
        let facet_name = if facet_id == "general" { "General Probe".to_string() } else { facet_id.clone() };

        Ok(Question {
            text: styled,
            metadata: QuestionMetadata {
                competency_id: competency.id.clone(),
                item_id: item_id.to_string(),
                facet_id,
                facet_name,
                followup_index,
                evidence_targets: targeted,
            },
        })
    }
}

/// Returns `Some(next)` when another follow-up is allowed for this item,
/// `None` once `max_followups` has been reached and the caller should
/// advance to the next item instead (spec §4.6).
pub fn next_followup_index(current: u8, max_followups: u32) -> Option<u8> {
    let next = current as u32 + 1;
    if next > max_followups {
        None
    } else {
        Some(next as u8)
    }
}

fn generic_probe(followup_index: u8) -> String {
    let idx = (followup_index as usize).min(GENERIC_LADDER.len() - 1);
    GENERIC_LADDER[idx].to_string()
}

fn intro_text(followup_index: u8, competency_name: &str) -> String {
    if followup_index == 0 {
        format!(
            "Begin this competency by linking a resume experience to the rubric. Ask a broad, \
             {competency_name}-aligned question that identifies a concrete project or decision the candidate handled."
        )
    } else {
        format!(
            "Continue the loop by targeting uncovered rubric criteria for {competency_name}. Reference previous \
             answers, avoid repetition, and deepen evidence until the rubric can be confidently scored."
        )
    }
}

fn format_criteria(criteria: &[String]) -> String {
    if criteria.is_empty() {
        "(all criteria addressed)".to_string()
    } else {
        criteria.iter().map(|c| format!("- {c}")).collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn followup_gating_stops_at_max() {
        assert_eq!(next_followup_index(0, 2), Some(1));
        assert_eq!(next_followup_index(1, 2), Some(2));
        assert_eq!(next_followup_index(2, 2), None);
    }

    #[test]
    fn generic_probe_ladder_is_bounded() {
        assert_eq!(generic_probe(0), GENERIC_LADDER[0]);
        assert_eq!(generic_probe(99), GENERIC_LADDER[GENERIC_LADDER.len() - 1]);
    }

    #[test]
    fn intro_text_differs_by_followup_index() {
        let first = intro_text(0, "Algorithms");
        let later = intro_text(1, "Algorithms");
        assert!(first.contains("Begin this competency"));
        assert!(later.contains("Continue the loop"));
    }
}
