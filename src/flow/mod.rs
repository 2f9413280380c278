//! Flow Manager (C5) — the heart of the engine. Consumes the current
//! `Session`, the allowed intent, any explicit quick action, and the
//! clock, and emits exactly one `Decision` while mutating the session in
//! place (spec §4.5).
//!
//! Grounded on the teacher's `orchestrator/router.rs` (routing-by-
//! priority) and `orchestrator/supervisor.rs` (a central coordinator
//! holding sub-collaborators it was handed, never reaching back into
//! them — Design Note "cyclic references... resolve by layering"),
//! combined with `original_source/flow_manager/__init__.py`'s stage
//! routing and `agents/flow_manager.py`'s turn-priority ladder. The Flow
//! Manager owns no oracle state itself; it is handed `QuestionGenerator`/
//! `Evaluator`/`HintAgent` references per call by the Turn Controller.

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::evaluator::Evaluator;
use crate::hint::HintAgent;
use crate::intent::IntentResult;
use crate::persona::{self, Purpose};
use crate::question::{next_followup_index, QuestionGenerator};
use crate::scoring;
use crate::session::{
    Competency, CompetencyProgress, Criterion, Decision, DecisionPayload, DecisionTag, Intent,
    Question, QuestionMetadata, QuickActionId, QuickActionRequest, Session, Stage,
};
use crate::utils::whitespace_token_count;

/// Synthetic competency used for the warm-up stage, which has no entry in
/// the candidate's rubric. `WU1`/"Context & Outcome" matches the fallback
/// facet the Hint Agent assumes when no question is yet on record
/// (`hint::HintAgent::generate`).
pub fn warmup_competency() -> Competency {
    Competency {
        id: "warmup".to_string(),
        name: "Warm-up".to_string(),
        criteria: vec![Criterion {
            id: "WU1".to_string(),
            name: "Context & Outcome".to_string(),
            weight: 1.0,
            anchors: std::array::from_fn(|_| String::new()),
        }],
    }
}

const WARMUP_PROGRESS_KEY: &str = "warmup";
const WRAPUP_ITEM_ID: &str = "wrapup-item";

pub(crate) fn default_palette(session: &Session) -> Vec<QuickActionId> {
    if session.skip_streak >= 3 {
        vec![QuickActionId::Hint, QuickActionId::Think30]
    } else {
        vec![QuickActionId::Hint, QuickActionId::Think30, QuickActionId::Repeat, QuickActionId::Skip]
    }
}

fn full_palette() -> Vec<QuickActionId> {
    vec![QuickActionId::Hint, QuickActionId::Think30, QuickActionId::Repeat, QuickActionId::Skip]
}

fn set_question(session: &mut Session, question: Question) {
    session.question_id = Some(format!("{}-{}", question.metadata.item_id, question.metadata.followup_index));
    session.question_text = Some(question.text.clone());
    session.question_metadata = Some(question.metadata.clone());
}

fn bump_question_index(session: &mut Session, key: &str) {
    session.competency_progress.entry(key.to_string()).or_default().question_index += 1;
}

fn sync_covered_criteria(session: &mut Session, competency_id: &str) {
    let levels = session.evaluator_memory.criterion_levels.get(competency_id).cloned().unwrap_or_default();
    let progress = session.competency_progress.entry(competency_id.to_string()).or_default();
    let mut covered: Vec<String> = levels.iter().filter(|(_, lvl)| **lvl > 0).map(|(id, _)| id.clone()).collect();
    covered.sort();
    covered.dedup();
    progress.covered_criteria = covered;
}

fn bump_low_score_counter(session: &mut Session, competency_id: &str) {
    session.competency_progress.entry(competency_id.to_string()).or_default().low_score_counter += 1;
}

fn should_advance_competency(progress: &CompetencyProgress, total_criteria: usize, cfg: &EngineConfig) -> bool {
    let covered = progress.covered_criteria.len();
    let coverage_complete = if total_criteria <= 1 {
        covered >= total_criteria
    } else {
        covered >= total_criteria.saturating_sub(1)
    };
    coverage_complete
        || progress.question_index >= cfg.max_followups_per_item
        || progress.low_score_counter >= cfg.max_followups_per_item
}

fn remaining_criteria(competency: &Competency, progress: &CompetencyProgress) -> Vec<String> {
    competency
        .criteria
        .iter()
        .map(|c| c.id.clone())
        .filter(|id| !progress.covered_criteria.contains(id))
        .collect()
}

pub struct FlowManager {
    config: EngineConfig,
}

impl FlowManager {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// I4: handle a monitor `BLOCK_AND_REFOCUS` outcome. On the third
    /// consecutive block, force `AUTO_SKIP_MOVED` and reset the streak;
    /// otherwise re-ask with the monitor's safe reply.
    pub async fn on_block(
        &self,
        session: &mut Session,
        safe_reply: &str,
        questions: &QuestionGenerator<'_>,
    ) -> EngineResult<Decision> {
        let tripped = session.register_block();
        if !tripped {
            return Ok(Decision::new(
                DecisionTag::Reask,
                DecisionPayload {
                    text: Some(safe_reply.to_string()),
                    quick_actions: vec![QuickActionId::Repeat],
                    ..Default::default()
                },
            ));
        }
        session.reset_blocks();
        if let Some(metadata) = session.question_metadata.clone() {
            scoring::mark_skip(&mut session.score_cache, &metadata.competency_id, &metadata.item_id);
        }
        self.advance(session, questions, DecisionTag::AutoSkipMoved, None).await
    }

    /// Main turn-routing ladder (spec §4.5, rules 1 and 3-6; rule 2 is
    /// handled by `on_block` before this is ever called, since this is
    /// only reached once the monitor has ALLOWed the turn).
    #[allow(clippy::too_many_arguments)]
    pub async fn decide(
        &self,
        session: &mut Session,
        intent_result: &IntentResult,
        quick_action: Option<QuickActionRequest>,
        questions: &QuestionGenerator<'_>,
        evaluator: &Evaluator<'_>,
        hints: &HintAgent<'_>,
        now: DateTime<Utc>,
    ) -> EngineResult<Decision> {
        // ALLOW resets the block-runaway counter (I4).
        session.reset_blocks();

        let decision = if let Some(qa) = quick_action {
            self.handle_quick_action(session, qa, questions, hints).await?
        } else {
            match &intent_result.intent {
                Intent::AskHint => self.emit_hint(session, hints).await?,
                Intent::AskThink => self.pause_think(session, now),
                Intent::AskPause => self.reask_pause(session),
                Intent::AskClarify => self.reask_clarify(session),
                Intent::Other => self.reask_other(session),
                Intent::Answer => {
                    if session.question_text.is_none() {
                        self.ask_first(session, questions).await?
                    } else if let Some(msg) = session.user_msg.clone() {
                        self.evaluate_and_continue(session, &msg, questions, evaluator).await?
                    } else {
                        self.fallback_reask(session)
                    }
                }
            }
        };

        self.post_emit(session, &decision);
        Ok(decision)
    }

    async fn handle_quick_action(
        &self,
        session: &mut Session,
        qa: QuickActionRequest,
        questions: &QuestionGenerator<'_>,
        hints: &HintAgent<'_>,
    ) -> EngineResult<Decision> {
        match qa.id {
            QuickActionId::Repeat => Ok(Decision::new(
                DecisionTag::Reask,
                DecisionPayload {
                    text: session.question_text.clone(),
                    question: self.current_question(session),
                    quick_actions: default_palette(session),
                    ..Default::default()
                },
            )),
            QuickActionId::Hint => self.emit_hint(session, hints).await,
            QuickActionId::Skip => {
                if let Some(metadata) = session.question_metadata.clone() {
                    scoring::mark_skip(&mut session.score_cache, &metadata.competency_id, &metadata.item_id);
                }
                session.skip_streak += 1;
                self.advance(session, questions, DecisionTag::SkipAndNext, None).await
            }
            QuickActionId::Think30 => Ok(self.pause_think(session, Utc::now())),
        }
    }

    async fn emit_hint(&self, session: &mut Session, hints: &HintAgent<'_>) -> EngineResult<Decision> {
        if session.hints_used_stage >= self.config.hints_per_stage {
            return Ok(Decision::new(
                DecisionTag::Hint,
                DecisionPayload {
                    text: Some("No hints remaining for this stage.".to_string()),
                    quick_actions: full_palette(),
                    exhausted: true,
                    ..Default::default()
                },
            ));
        }
        let hint_text = hints.generate(session).await?;
        session.hints_used_stage += 1;
        Ok(Decision::new(
            DecisionTag::Hint,
            DecisionPayload {
                text: Some(hint_text),
                quick_actions: full_palette(),
                exhausted: session.hints_used_stage >= self.config.hints_per_stage,
                ..Default::default()
            },
        ))
    }

    fn pause_think(&self, session: &mut Session, now: DateTime<Utc>) -> Decision {
        let think_until = now + chrono::Duration::seconds(self.config.think_seconds);
        session.think_until = Some(think_until);
        let text = persona::apply_persona(
            "Take your time. I'll check back in a bit.",
            &session.persona,
            Purpose::Remind,
            2,
        );
        Decision::new(
            DecisionTag::PauseThink,
            DecisionPayload {
                text: Some(text),
                think_until: Some(think_until),
                quick_actions: default_palette(session),
                ..Default::default()
            },
        )
    }

    fn reask_pause(&self, session: &mut Session) -> Decision {
        let text = persona::apply_persona(
            "No problem, we can pick this back up whenever you're ready.",
            &session.persona,
            Purpose::Resume,
            2,
        );
        Decision::new(
            DecisionTag::Reask,
            DecisionPayload {
                text: Some(text),
                question: self.current_question(session),
                quick_actions: default_palette(session),
                ..Default::default()
            },
        )
    }

    fn reask_clarify(&self, session: &mut Session) -> Decision {
        let base = session.question_text.clone().unwrap_or_default();
        let text = persona::apply_persona(&base, &session.persona, Purpose::Clarify, 2);
        Decision::new(
            DecisionTag::Clarify,
            DecisionPayload {
                text: Some(text),
                question: self.current_question(session),
                quick_actions: default_palette(session),
                ..Default::default()
            },
        )
    }

    fn reask_other(&self, session: &mut Session) -> Decision {
        let base = session.question_text.clone().unwrap_or_default();
        let text = persona::apply_persona(&base, &session.persona, Purpose::Redirect, 2);
        Decision::new(
            DecisionTag::Reask,
            DecisionPayload {
                text: Some(text),
                question: self.current_question(session),
                quick_actions: default_palette(session),
                ..Default::default()
            },
        )
    }

    fn fallback_reask(&self, session: &mut Session) -> Decision {
        Decision::new(
            DecisionTag::Reask,
            DecisionPayload {
                text: session.question_text.clone(),
                question: self.current_question(session),
                quick_actions: default_palette(session),
                ..Default::default()
            },
        )
    }

    pub(crate) fn current_question(&self, session: &Session) -> Option<Question> {
        match (&session.question_text, &session.question_metadata) {
            (Some(text), Some(metadata)) => Some(Question { text: text.clone(), metadata: metadata.clone() }),
            _ => None,
        }
    }

    /// Rule 4: no current question on record — ask the opening question
    /// for the active stage.
    async fn ask_first(&self, session: &mut Session, questions: &QuestionGenerator<'_>) -> EngineResult<Decision> {
        match session.stage {
            Stage::Warmup => {
                let competency = warmup_competency();
                let q = questions
                    .generate(&competency, "WU1", &["WU1".to_string()], 0, &session.persona)
                    .await?;
                set_question(session, q.clone());
                bump_question_index(session, WARMUP_PROGRESS_KEY);
                Ok(Decision::new(
                    DecisionTag::Ask,
                    DecisionPayload { question: Some(q), quick_actions: default_palette(session), ..Default::default() },
                ))
            }
            Stage::Competency => {
                let Some(competency) = session.current_competency().cloned() else {
                    return self.advance(session, questions, DecisionTag::EvalAndAskNext, None).await;
                };
                let remaining: Vec<String> = competency.criteria.iter().map(|c| c.id.clone()).collect();
                let item_id = format!("{}-item0", competency.id);
                let q = questions.generate(&competency, &item_id, &remaining, 0, &session.persona).await?;
                set_question(session, q.clone());
                bump_question_index(session, &competency.id);
                Ok(Decision::new(
                    DecisionTag::Ask,
                    DecisionPayload { question: Some(q), quick_actions: default_palette(session), ..Default::default() },
                ))
            }
            Stage::Wrapup => Ok(self.ask_wrapup(session)),
            Stage::Complete => Ok(self.complete_decision(session)),
        }
    }

    fn ask_wrapup(&self, session: &mut Session) -> Decision {
        let text = persona::apply_persona(
            "Is there anything else about your experience you'd like to highlight before we wrap up?",
            &session.persona,
            Purpose::Wrapup,
            2,
        );
        let metadata = QuestionMetadata {
            competency_id: "wrapup".to_string(),
            item_id: WRAPUP_ITEM_ID.to_string(),
            facet_id: "closing".to_string(),
            facet_name: "Closing Statement".to_string(),
            followup_index: 0,
            evidence_targets: Vec::new(),
        };
        set_question(session, Question { text: text.clone(), metadata });
        Decision::new(
            DecisionTag::Ask,
            DecisionPayload { text: Some(text.clone()), question: self.current_question(session), quick_actions: vec![QuickActionId::Repeat], ..Default::default() },
        )
    }

    /// Rule 5: a user answer is present for the outstanding question —
    /// evaluate it and decide whether to probe deeper or move on.
    async fn evaluate_and_continue(
        &self,
        session: &mut Session,
        reply: &str,
        questions: &QuestionGenerator<'_>,
        evaluator: &Evaluator<'_>,
    ) -> EngineResult<Decision> {
        let metadata = session
            .question_metadata
            .clone()
            .expect("rule 5 only runs when a question is outstanding");

        if metadata.competency_id == "wrapup" {
            return self.advance(session, questions, DecisionTag::EvalAndAskNext, None).await;
        }

        let competency = if metadata.competency_id == "warmup" {
            warmup_competency()
        } else {
            session.rubric.competency(&metadata.competency_id).cloned().unwrap_or_else(warmup_competency)
        };

        let turn_index = session
            .score_cache
            .competencies
            .get(&metadata.competency_id)
            .and_then(|b| b.items.get(&metadata.item_id))
            .map(|i| i.turns.len() as u32)
            .unwrap_or(0);

        let is_low_content = whitespace_token_count(reply) < self.config.low_content_tokens;
        let question_text = session.question_text.clone().unwrap_or_default();

        let eval = evaluator
            .evaluate(
                &competency,
                &metadata.item_id,
                turn_index,
                &question_text,
                reply,
                &mut session.evaluator_memory,
                false,
                is_low_content,
            )
            .await?;

        sync_covered_criteria(session, &metadata.competency_id);
        if eval.overall < self.config.low_score_threshold {
            bump_low_score_counter(session, &metadata.competency_id);
        }

        scoring::record_eval(&mut session.score_cache, eval.clone());
        let item_best_of = session
            .score_cache
            .competencies
            .get(&metadata.competency_id)
            .and_then(|b| b.items.get(&metadata.item_id))
            .map(|i| i.best_of)
            .unwrap_or(eval.overall);

        if metadata.competency_id == "warmup" {
            return self.advance(session, questions, DecisionTag::EvalAndAskNext, Some(eval)).await;
        }

        let decision = if let Some(next_idx) = next_followup_index(metadata.followup_index, self.config.max_followups_per_item) {
            if item_best_of < self.config.high_satisfied {
                let progress = session.competency_progress.entry(metadata.competency_id.clone()).or_default().clone();
                let remaining = remaining_criteria(&competency, &progress);
                let q = questions.generate(&competency, &metadata.item_id, &remaining, next_idx, &session.persona).await?;
                set_question(session, q.clone());
                bump_question_index(session, &competency.id);
                Decision::new(
                    DecisionTag::Ask,
                    DecisionPayload {
                        question: Some(q),
                        eval: Some(eval),
                        quick_actions: default_palette(session),
                        ..Default::default()
                    },
                )
            } else {
                self.advance(session, questions, DecisionTag::EvalAndAskNext, Some(eval)).await?
            }
        } else {
            self.advance(session, questions, DecisionTag::EvalAndAskNext, Some(eval)).await?
        };

        Ok(decision)
    }

    /// Moves to the next item, competency, or stage. Shared by
    /// `EVAL_AND_ASK_NEXT`, `SKIP_AND_NEXT`, and `AUTO_SKIP_MOVED`.
    async fn advance(
        &self,
        session: &mut Session,
        questions: &QuestionGenerator<'_>,
        tag: DecisionTag,
        eval: Option<crate::session::EvalResult>,
    ) -> EngineResult<Decision> {
        match session.stage {
            Stage::Warmup => {
                let asked = session.competency_progress.get(WARMUP_PROGRESS_KEY).map(|p| p.question_index).unwrap_or(0);
                if asked >= self.config.warmup_question_count {
                    session.stage = Stage::Competency;
                    session.hints_used_stage = 0;
                    session.current_competency_index = 0;
                    session.current_item_index = 0;
                    return self.ask_first_with_tag(session, questions, tag, eval).await;
                }
                let next_item = format!("WU{}", asked + 1);
                let competency = warmup_competency();
                let q = questions.generate(&competency, &next_item, &["WU1".to_string()], 0, &session.persona).await?;
                set_question(session, q.clone());
                bump_question_index(session, WARMUP_PROGRESS_KEY);
                Ok(Decision::new(tag, DecisionPayload { question: Some(q), eval, quick_actions: default_palette(session), ..Default::default() }))
            }
            Stage::Competency => self.advance_competency(session, questions, tag, eval).await,
            Stage::Wrapup => {
                session.stage = Stage::Complete;
                Ok(self.finalize_decision(session, tag))
            }
            Stage::Complete => Ok(self.complete_decision(session)),
        }
    }

    async fn ask_first_with_tag(
        &self,
        session: &mut Session,
        questions: &QuestionGenerator<'_>,
        tag: DecisionTag,
        eval: Option<crate::session::EvalResult>,
    ) -> EngineResult<Decision> {
        let decision = self.ask_first(session, questions).await?;
        Ok(Decision::new(tag, DecisionPayload { eval, ..decision.payload }))
    }

    async fn advance_competency(
        &self,
        session: &mut Session,
        questions: &QuestionGenerator<'_>,
        tag: DecisionTag,
        eval: Option<crate::session::EvalResult>,
    ) -> EngineResult<Decision> {
        let Some(competency) = session.current_competency().cloned() else {
            session.stage = Stage::Wrapup;
            return Ok(Decision::new(tag, DecisionPayload { eval, ..self.ask_wrapup(session).payload }));
        };

        let progress = session.competency_progress.entry(competency.id.clone()).or_default().clone();
        if should_advance_competency(&progress, competency.criteria.len(), &self.config) {
            let next_index = session.current_competency_index + 1;
            if next_index >= session.rubric.competencies.len() {
                session.stage = Stage::Wrapup;
                let wrap = self.ask_wrapup(session);
                return Ok(Decision::new(tag, DecisionPayload { eval, ..wrap.payload }));
            }
            session.current_competency_index = next_index;
            session.current_item_index = 0;
            session.hints_used_stage = 0;
            let next_competency = session.current_competency().cloned().expect("index just validated");
            let remaining: Vec<String> = next_competency.criteria.iter().map(|c| c.id.clone()).collect();
            let item_id = format!("{}-item0", next_competency.id);
            let q = questions.generate(&next_competency, &item_id, &remaining, 0, &session.persona).await?;
            set_question(session, q.clone());
            bump_question_index(session, &next_competency.id);
            Ok(Decision::new(tag, DecisionPayload { question: Some(q), eval, quick_actions: default_palette(session), ..Default::default() }))
        } else {
            session.current_item_index += 1;
            let item_id = format!("{}-item{}", competency.id, session.current_item_index);
            let remaining = remaining_criteria(&competency, &progress);
            let q = questions.generate(&competency, &item_id, &remaining, 0, &session.persona).await?;
            set_question(session, q.clone());
            bump_question_index(session, &competency.id);
            Ok(Decision::new(tag, DecisionPayload { question: Some(q), eval, quick_actions: default_palette(session), ..Default::default() }))
        }
    }

    fn finalize_decision(&self, session: &mut Session, tag: DecisionTag) -> Decision {
        let live_scores = scoring::finalize_overall(&session.score_cache);
        let text = persona::apply_persona(
            "Thanks for your time today — that wraps up the interview.",
            &session.persona,
            Purpose::Wrapup,
            2,
        );
        session.question_id = None;
        session.question_text = None;
        session.question_metadata = None;
        Decision::new(tag, DecisionPayload { text: Some(text), live_scores: Some(live_scores), quick_actions: Vec::new(), ..Default::default() })
    }

    fn complete_decision(&self, session: &Session) -> Decision {
        let live_scores = scoring::finalize_overall(&session.score_cache);
        Decision::new(
            DecisionTag::EvalAndAskNext,
            DecisionPayload {
                text: Some("This interview has already concluded.".to_string()),
                live_scores: Some(live_scores),
                quick_actions: Vec::new(),
                ..Default::default()
            },
        )
    }

    /// Post-emit bookkeeping shared by the ask/advance/auto-skip family
    /// (spec §4.5: absorb the nudge once the skip streak has been acted
    /// on by any of these three tags).
    fn post_emit(&self, session: &mut Session, decision: &Decision) {
        if matches!(decision.tag, DecisionTag::Ask | DecisionTag::EvalAndAskNext | DecisionTag::AutoSkipMoved) {
            session.maybe_absorb_nudge(self.config.nudge_after_consecutive_skips);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Competency, Criterion, Rubric};

    fn sample_rubric() -> Rubric {
        Rubric {
            competencies: vec![Competency {
                id: "leadership".to_string(),
                name: "Leadership".to_string(),
                criteria: vec![Criterion {
                    id: "impact".to_string(),
                    name: "Impact".to_string(),
                    weight: 1.0,
                    anchors: std::array::from_fn(|_| String::new()),
                }],
            }],
        }
    }

    #[test]
    fn palette_degrades_at_three_skips() {
        let mut session = Session::new("s1", "i1", "c1", None);
        assert_eq!(default_palette(&session), full_palette());
        session.skip_streak = 3;
        assert_eq!(default_palette(&session), vec![QuickActionId::Hint, QuickActionId::Think30]);
    }

    #[test]
    fn should_advance_on_single_criterion_coverage() {
        let cfg = EngineConfig::default();
        let mut progress = CompetencyProgress::default();
        assert!(!should_advance_competency(&progress, 1, &cfg));
        progress.covered_criteria.push("impact".to_string());
        assert!(should_advance_competency(&progress, 1, &cfg));
    }

    #[test]
    fn should_advance_on_question_cap() {
        let cfg = EngineConfig::default();
        let mut progress = CompetencyProgress::default();
        progress.question_index = cfg.max_followups_per_item;
        assert!(should_advance_competency(&progress, 5, &cfg));
    }

    #[test]
    fn remaining_criteria_excludes_covered() {
        let rubric = sample_rubric();
        let competency = rubric.competency("leadership").unwrap();
        let mut progress = CompetencyProgress::default();
        progress.covered_criteria.push("impact".to_string());
        assert!(remaining_criteria(competency, &progress).is_empty());
    }

    #[test]
    fn post_emit_absorbs_nudge_on_ask() {
        let flow = FlowManager::new(EngineConfig::default());
        let mut session = Session::new("s1", "i1", "c1", None);
        session.skip_streak = 3;
        let decision = Decision::new(DecisionTag::Ask, DecisionPayload::default());
        flow.post_emit(&mut session, &decision);
        assert_eq!(session.skip_streak, 0);
    }

    #[test]
    fn post_emit_leaves_skip_streak_on_reask() {
        let flow = FlowManager::new(EngineConfig::default());
        let mut session = Session::new("s1", "i1", "c1", None);
        session.skip_streak = 3;
        let decision = Decision::new(DecisionTag::Reask, DecisionPayload::default());
        flow.post_emit(&mut session, &decision);
        assert_eq!(session.skip_streak, 3);
    }
}
