//! Hint Agent (spec §11 supplement) — generates a short persona-styled
//! hint for the active facet, informed by up to three prior hints so it
//! doesn't repeat itself.
//!
//! Ported from `original_source/agents/hint_agent.py::run`: the
//! last-three-prior-hints window passed into the prompt, the
//! empty-reply fallback line, and the `apply_persona(purpose="hint")`
//! styling pass. Prior-hint bookkeeping itself lives on `Session`
//! (`push_hint`/`hint_history`, capped at five per facet) rather than a
//! second ad hoc store.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::llm::OracleAdapter;
use crate::persona::{self, Purpose};
use crate::session::Session;

const FALLBACK_HINT: &str = "Offer one concrete step toward this facet.";
/// Only the most recent hints are useful context for "don't repeat
/// yourself" — older ones stay in `Session::hint_history` for the record
/// but are not replayed into the prompt.
const PRIOR_HINT_WINDOW: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HintPlan {
    #[serde(default)]
    pub hint: String,
}

pub struct HintAgent<'a> {
    adapter: &'a OracleAdapter,
    oracle_name: String,
}

impl<'a> HintAgent<'a> {
    pub fn new(adapter: &'a OracleAdapter, oracle_name: impl Into<String>) -> Self {
        Self { adapter, oracle_name: oracle_name.into() }
    }

    /// Generate and style a hint for the facet currently recorded on
    /// `session.question_metadata`, then append it to that facet's hint
    /// history. Returns the styled hint text.
    pub async fn generate(&self, session: &mut Session) -> EngineResult<String> {
        let facet_id = session
            .question_metadata
            .as_ref()
            .map(|m| m.facet_id.clone())
            .unwrap_or_else(|| "WU1".to_string());
        let facet_name = session
            .question_metadata
            .as_ref()
            .map(|m| m.facet_name.clone())
            .unwrap_or_else(|| "Context & Outcome".to_string());
        let evidence_targets = session
            .question_metadata
            .as_ref()
            .map(|m| m.evidence_targets.clone())
            .unwrap_or_default();
        let question_text = session.question_text.clone().unwrap_or_default();
        let last_reply = session.user_msg.clone().unwrap_or_default();

        let prior_hints: Vec<String> = session
            .hint_history
            .get(&facet_id)
            .map(|hist| hist.iter().rev().take(PRIOR_HINT_WINDOW).rev().cloned().collect())
            .unwrap_or_default();

        let prompt = format!(
            "Persona: {}\nFacet: {facet_id} ({facet_name})\nQuestion: {question_text}\n\
             Evidence targets: {:?}\nPrior hints: {:?}\nLast reply: {last_reply}\n\
             Give one concrete, non-repetitive hint in at most two sentences.",
            session.persona, evidence_targets, prior_hints,
        );

        let plan = self
            .adapter
            .call::<HintPlan>(&self.oracle_name, Vec::new(), vec![prompt])
            .await
            .unwrap_or_else(|_| HintPlan { hint: String::new() });

        let raw_hint = if plan.hint.trim().is_empty() { FALLBACK_HINT.to_string() } else { plan.hint.trim().to_string() };
        let styled = persona::apply_persona(&raw_hint, &session.persona, Purpose::Hint, 2);

        session.push_hint(&facet_id, styled.clone());
        Ok(styled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::QuestionMetadata;

    #[test]
    fn fallback_hint_used_when_plan_is_empty() {
        let plan = HintPlan { hint: String::new() };
        let raw = if plan.hint.trim().is_empty() { FALLBACK_HINT.to_string() } else { plan.hint };
        assert_eq!(raw, FALLBACK_HINT);
    }

    #[test]
    fn prior_hint_window_keeps_only_last_three_in_order() {
        let mut session = Session::new("s1", "i1", "c1", None);
        session.question_metadata = Some(QuestionMetadata {
            competency_id: "c".to_string(),
            item_id: "i".to_string(),
            facet_id: "f1".to_string(),
            facet_name: "F1".to_string(),
            followup_index: 0,
            evidence_targets: vec![],
        });
        for i in 0..5 {
            session.push_hint("f1", format!("hint-{i}"));
        }
        let prior: Vec<String> = session.hint_history["f1"].iter().rev().take(PRIOR_HINT_WINDOW).rev().cloned().collect();
        assert_eq!(prior, vec!["hint-2", "hint-3", "hint-4"]);
    }
}
