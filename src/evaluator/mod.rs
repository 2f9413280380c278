//! Response Evaluator (C7) — scores a candidate's answer against the
//! active competency's rubric criteria and keeps a running evaluator
//! memory (summary + monotonic criterion levels).
//!
//! Grounded on `original_source/flow_manager/agents/evaluator.py`
//! (`EvaluatorAgent`/`EvaluationPlan`, the `_normalize_score`/
//! `_clamp_level` clamping) for the algorithm, and on the teacher's
//! `agent/provider.rs` oracle-call seam for the Rust plumbing. Policy
//! short-circuits (blocked or low-content turns never reach the oracle)
//! are a spec addition over the original, which always called the LLM.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineResult;
use crate::llm::OracleAdapter;
use crate::session::{Band, Competency, EvalResult, EvaluatorMemory};

/// Score assigned when policy short-circuits the turn (blocked content or
/// too little to evaluate) instead of calling the oracle.
const NEUTRAL_SCORE: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationPlan {
    pub updated_summary: String,
    /// criterion id -> raw score, clamped to 1..5 after the oracle replies.
    pub criterion_scores: HashMap<String, u8>,
    pub notes: String,
}

fn clamp_score(raw: u8) -> u8 {
    raw.clamp(1, 5)
}

pub struct Evaluator<'a> {
    adapter: &'a OracleAdapter,
    oracle_name: String,
}

impl<'a> Evaluator<'a> {
    pub fn new(adapter: &'a OracleAdapter, oracle_name: impl Into<String>) -> Self {
        Self { adapter, oracle_name: oracle_name.into() }
    }

    /// Evaluate one turn. `is_blocked`/`is_low_content` short-circuit to a
    /// neutral score for every criterion without invoking the oracle
    /// (spec §4.7's policy-override path).
    pub async fn evaluate(
        &self,
        competency: &Competency,
        item_id: &str,
        turn_index: u32,
        question_text: &str,
        answer_text: &str,
        memory: &mut EvaluatorMemory,
        is_blocked: bool,
        is_low_content: bool,
    ) -> EngineResult<EvalResult> {
        let criterion_scores = if is_blocked || is_low_content {
            let reason = if is_blocked { "blocked input" } else { "low-content input" };
            warn!(competency = %competency.id, item_id, reason, "evaluator short-circuit, neutral score applied");
            competency.criteria.iter().map(|c| (c.id.clone(), NEUTRAL_SCORE)).collect()
        } else {
            self.oracle_scores(competency, question_text, answer_text, memory).await
        };

        for (criterion_id, score) in &criterion_scores {
            memory.raise_level(&competency.id, criterion_id, *score);
        }

        let overall = weighted_overall(competency, &criterion_scores);
        let band = Band::from_overall(overall);

        Ok(EvalResult {
            competency_id: competency.id.clone(),
            item_id: item_id.to_string(),
            turn_index,
            criterion_scores,
            overall,
            band,
            notes: if is_blocked || is_low_content { "short-circuited by policy override".to_string() } else { String::new() },
        })
    }

    async fn oracle_scores(
        &self,
        competency: &Competency,
        question_text: &str,
        answer_text: &str,
        memory: &mut EvaluatorMemory,
    ) -> HashMap<String, u8> {
        let prompt = format!(
            "Competency: {}\nCriteria: {}\nCurrent Summary: {}\nQuestion: {question_text}\nAnswer: {answer_text}\n\
             Return an updated summary and a 1-5 score for each criterion id.",
            competency.name,
            competency.criteria.iter().map(|c| c.id.as_str()).collect::<Vec<_>>().join(", "),
            memory.summary,
        );

        match self.adapter.call::<EvaluationPlan>(&self.oracle_name, Vec::new(), vec![prompt]).await {
            Ok(plan) => {
                memory.summary = plan.updated_summary;
                competency
                    .criteria
                    .iter()
                    .map(|c| {
                        let raw = plan.criterion_scores.get(&c.id).copied().unwrap_or(NEUTRAL_SCORE);
                        (c.id.clone(), clamp_score(raw))
                    })
                    .collect()
            }
            Err(e) => {
                warn!(error = %e, "evaluator oracle call failed, falling back to neutral scores");
                competency.criteria.iter().map(|c| (c.id.clone(), NEUTRAL_SCORE)).collect()
            }
        }
    }
}

/// Weighted average over the competency's criteria, rounded to one
/// decimal. Falls back to a plain neutral score if the competency
/// carries no weight at all.
fn weighted_overall(competency: &Competency, criterion_scores: &HashMap<String, u8>) -> f64 {
    let total_weight = competency.total_weight();
    if total_weight <= 0.0 {
        return NEUTRAL_SCORE as f64;
    }
    let weighted_sum: f64 = competency
        .criteria
        .iter()
        .map(|c| criterion_scores.get(&c.id).copied().unwrap_or(NEUTRAL_SCORE) as f64 * c.weight)
        .sum();
    ((weighted_sum / total_weight) * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Criterion;

    fn sample_competency() -> Competency {
        Competency {
            id: "algorithms".to_string(),
            name: "Algorithms".to_string(),
            criteria: vec![
                Criterion {
                    id: "correctness".to_string(),
                    name: "Correctness".to_string(),
                    weight: 2.0,
                    anchors: std::array::from_fn(|_| String::new()),
                },
                Criterion {
                    id: "complexity".to_string(),
                    name: "Complexity".to_string(),
                    weight: 1.0,
                    anchors: std::array::from_fn(|_| String::new()),
                },
            ],
        }
    }

    #[test]
    fn weighted_overall_respects_weights() {
        let competency = sample_competency();
        let mut scores = HashMap::new();
        scores.insert("correctness".to_string(), 4);
        scores.insert("complexity".to_string(), 2);
        let overall = weighted_overall(&competency, &scores);
        assert_eq!(overall, 3.3);
    }

    #[test]
    fn clamp_score_bounds_to_1_5() {
        assert_eq!(clamp_score(0), 1);
        assert_eq!(clamp_score(9), 5);
        assert_eq!(clamp_score(3), 3);
    }

    #[test]
    fn zero_weight_competency_falls_back_to_neutral() {
        let competency = Competency { id: "x".to_string(), name: "X".to_string(), criteria: vec![] };
        let overall = weighted_overall(&competency, &HashMap::new());
        assert_eq!(overall, NEUTRAL_SCORE as f64);
    }
}
