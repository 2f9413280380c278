//! Intent Classifier Gate (C4) — asks an oracle to label the candidate's
//! intent, then coerces low-confidence or malformed results rather than
//! letting them propagate (spec §4.4).
//!
//! Grounded on `original_source/agents/intent_classifier.py::classify_intent`
//! (the 0.60 confidence floor and the `ask_clarify` coercion) and on the
//! teacher's `agent/provider.rs` trait-call shape for the oracle seam.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::llm::OracleAdapter;
use crate::session::Intent;

/// Below this confidence, the raw classification is discarded in favor of
/// `ask_clarify` — low-confidence intents are not acted on directly.
pub const CONFIDENCE_FLOOR: f64 = 0.60;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IntentResult {
    pub intent: Intent,
    pub confidence: f64,
    pub rationale: String,
}

impl IntentResult {
    fn fallback() -> Self {
        Self { intent: Intent::Other, confidence: 0.0, rationale: "fallback parsing".to_string() }
    }
}

pub struct IntentClassifier<'a> {
    adapter: &'a OracleAdapter,
    oracle_name: String,
}

impl<'a> IntentClassifier<'a> {
    pub fn new(adapter: &'a OracleAdapter, oracle_name: impl Into<String>) -> Self {
        Self { adapter, oracle_name: oracle_name.into() }
    }

    pub async fn classify(&self, stage: &str, question_text: &str, user_msg: &str) -> EngineResult<IntentResult> {
        let prompt = format!(
            "stage: {stage}\nquestion_text: {question_text}\nuser_msg: {user_msg}\n\
             Classify the candidate's intent for this turn."
        );
        let result = match self.adapter.call::<IntentResult>(&self.oracle_name, Vec::new(), vec![prompt]).await {
            Ok(r) => r,
            Err(_) => IntentResult::fallback(),
        };
        Ok(coerce_low_confidence(result))
    }
}

/// Below `CONFIDENCE_FLOOR`, force `ask_clarify` rather than trust a weak
/// label; the rationale and confidence are preserved for observability.
fn coerce_low_confidence(result: IntentResult) -> IntentResult {
    if result.confidence < CONFIDENCE_FLOOR {
        IntentResult {
            intent: Intent::AskClarify,
            confidence: result.confidence,
            rationale: result.rationale,
        }
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_confidence_passes_through() {
        let result = IntentResult { intent: Intent::Answer, confidence: 0.9, rationale: "clear answer".to_string() };
        let coerced = coerce_low_confidence(result);
        assert_eq!(coerced.intent, Intent::Answer);
    }

    #[test]
    fn low_confidence_is_coerced_to_ask_clarify() {
        let result = IntentResult { intent: Intent::Answer, confidence: 0.4, rationale: "unsure".to_string() };
        let coerced = coerce_low_confidence(result);
        assert_eq!(coerced.intent, Intent::AskClarify);
        assert_eq!(coerced.confidence, 0.4);
    }

    #[test]
    fn boundary_confidence_is_not_coerced() {
        let result = IntentResult { intent: Intent::AskHint, confidence: CONFIDENCE_FLOOR, rationale: "at floor".to_string() };
        let coerced = coerce_low_confidence(result);
        assert_eq!(coerced.intent, Intent::AskHint);
    }

    #[test]
    fn fallback_is_other_with_zero_confidence() {
        let fallback = IntentResult::fallback();
        assert_eq!(fallback.intent, Intent::Other);
        assert_eq!(fallback.confidence, 0.0);
    }
}
