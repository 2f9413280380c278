//! Turn Controller (C10) — the engine's single public entry point. Owns
//! the long-lived collaborators (checkpoint store, safety monitor, oracle
//! adapter, flow manager, observability sink) and composes them into
//! `start`/`turn`/`finish` per spec §4.10 and §6.2.
//!
//! Grounded on the teacher's `orchestrator/supervisor.rs` (a struct built
//! once at startup holding every collaborator by reference/Arc, exposing
//! a handful of top-level async methods, `#[tracing::instrument]` on the
//! hot path) and on `original_source/services/turn_controller.py::handle_turn`
//! for the lock → safety → intent → flow → checkpoint pipeline order.
//! Session id minting follows `orchestrator/supervisor.rs`'s
//! `Uuid::new_v4()` convention.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::evaluator::Evaluator;
use crate::flow::{self, FlowManager};
use crate::hint::HintAgent;
use crate::intent::{IntentClassifier, IntentResult};
use crate::llm::OracleAdapter;
use crate::observability::{InterviewFlag, ObservabilitySink, QuickActionLog};
use crate::question::QuestionGenerator;
use crate::safety::{self, MonitorAction, SafetyEngine};
use crate::scoring;
use crate::session::store::CheckpointStore;
use crate::session::{Decision, DecisionPayload, DecisionTag, Intent, LiveScores, QuickActionRequest, Rubric, Session, Stage};

/// Oracle route names the engine expects to find bound in the
/// `OracleAdapter` passed to `Engine::new` (spec §4.2's "runtime registry
/// of oracles").
pub const ORACLE_QUESTION_GENERATOR: &str = "question_generator";
pub const ORACLE_EVALUATOR: &str = "evaluator";
pub const ORACLE_HINT_AGENT: &str = "hint_agent";
pub const ORACLE_INTENT_CLASSIFIER: &str = "intent_classifier";

/// One turn's input from the transport layer: either free text or an
/// explicit quick action, never both (spec §4.10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnInput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quick_action: Option<QuickActionRequest>,
    #[serde(default)]
    pub client_ts: Option<String>,
}

pub struct Engine {
    store: CheckpointStore,
    safety: Mutex<SafetyEngine>,
    adapter: OracleAdapter,
    flow: FlowManager,
    config: EngineConfig,
    sink: Arc<dyn ObservabilitySink>,
}

impl Engine {
    pub fn new(config: EngineConfig, adapter: OracleAdapter, safety: SafetyEngine, sink: Arc<dyn ObservabilitySink>) -> Self {
        let store = CheckpointStore::new(config.checkpoint_dir.clone());
        let flow = FlowManager::new(config.clone());
        Self { store, safety: Mutex::new(safety), adapter, flow, config, sink }
    }

    fn collaborators(&self) -> (QuestionGenerator<'_>, Evaluator<'_>, HintAgent<'_>, IntentClassifier<'_>) {
        (
            QuestionGenerator::new(&self.adapter, ORACLE_QUESTION_GENERATOR),
            Evaluator::new(&self.adapter, ORACLE_EVALUATOR),
            HintAgent::new(&self.adapter, ORACLE_HINT_AGENT),
            IntentClassifier::new(&self.adapter, ORACLE_INTENT_CLASSIFIER),
        )
    }

    /// Create a new session for `interview_id`/`candidate_id`, seed its
    /// rubric, and emit the opening warm-up question.
    #[instrument(skip(self, rubric))]
    pub async fn start(&self, interview_id: &str, candidate_id: &str, rubric: Rubric, persona: Option<String>) -> EngineResult<(String, Decision)> {
        let session_id = Uuid::new_v4().to_string();
        let mut session = Session::new(session_id.clone(), interview_id, candidate_id, persona);
        session.rubric = rubric;

        let (questions, evaluator, hints, _intent) = self.collaborators();
        let opening_intent = IntentResult { intent: Intent::Answer, confidence: 1.0, rationale: "session start".to_string() };
        let start = Instant::now();
        let decision = self.flow.decide(&mut session, &opening_intent, None, &questions, &evaluator, &hints, Utc::now()).await?;
        session.record_event("turn_controller", format!("{:?}", decision.tag), start.elapsed().as_millis() as u64);

        self.store.save(&session).await?;
        if let Some(event) = session.event_log.last() {
            self.sink.record_event(&session_id, event).await;
        }
        Ok((session_id, decision))
    }

    /// Handle one turn for an existing session: acquire the per-session
    /// lock, run the safety → intent → flow pipeline (or the quick-action
    /// shortcut, which bypasses both), checkpoint, and return the
    /// resulting decision.
    #[instrument(skip(self, input))]
    pub async fn turn(&self, session_id: &str, input: TurnInput) -> EngineResult<Decision> {
        let _guard = self.store.lock(session_id).await?;
        let mut session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let start = Instant::now();
        session.turn_counter += 1;
        session.client_ts = input.client_ts.clone();
        let now = Utc::now();

        // §4.10 step 2 / §4.9: an expired think-timer is checked on every
        // turn entry, unconditionally, before the safety/intent/flow
        // pipeline runs at all.
        if let Some(payload) = crate::interrupt::maybe_resume_think(&session, now) {
            if payload.clear_think_timer {
                session.think_until = None;
            }
            let decision = Decision::new(
                DecisionTag::Reask,
                DecisionPayload {
                    text: Some(payload.resume_line.clone()),
                    question: crate::interrupt::resume_question(&payload),
                    quick_actions: flow::default_palette(&session),
                    ..Default::default()
                },
            );
            session.record_event("turn_controller", "think_expired_resume", start.elapsed().as_millis() as u64);
            self.store.save(&session).await?;
            if let Some(event) = session.event_log.last() {
                self.sink.record_event(session_id, event).await;
            }
            return Ok(decision);
        }

        let (questions, evaluator, hints, intent_classifier) = self.collaborators();

        let decision = if let Some(qa) = input.quick_action.clone() {
            // §4.10 step 3: a message riding alongside an explicit quick
            // action is not dropped — it is queued and drained on the
            // caller's next (typically input-less) turn.
            if let Some(text) = input.text.clone().filter(|t| !t.trim().is_empty()) {
                session.queued_user_msg = Some(text);
            }
            session.quick_action = Some(qa.clone());
            session.think_until = None;
            let placeholder = IntentResult { intent: Intent::Answer, confidence: 1.0, rationale: "explicit quick action".to_string() };
            let decision = self.flow.decide(&mut session, &placeholder, Some(qa.clone()), &questions, &evaluator, &hints, now).await?;
            self.sink
                .record_quick_action(&QuickActionLog {
                    timestamp: now,
                    session_id: session_id.to_string(),
                    interview_id: session.interview_id.clone(),
                    candidate_id: session.candidate_id.clone(),
                    stage: session.stage,
                    question_id: session.question_id.clone(),
                    action_id: format!("{:?}", qa.id),
                    source: "explicit".to_string(),
                    latency_ms: None,
                    metadata: serde_json::Value::Null,
                })
                .await;
            decision
        } else {
            // §4.10 step 3: merge incoming user_msg against any message
            // queued by a prior quick-action-plus-text turn. An empty/absent
            // `text` with a queued message pending drains the queue first;
            // a present `text` is used as-is and does not disturb the queue.
            let incoming = input.text.clone().filter(|t| !t.trim().is_empty());
            let text = match incoming {
                Some(t) => t,
                None => session.queued_user_msg.take().unwrap_or_default(),
            };
            session.think_until = None;
            session.user_msg = Some(text.clone());

            let token_count = crate::utils::whitespace_token_count(&text);
            let similarity = topic_similarity(session.question_text.as_deref().unwrap_or(""), &text);

            let monitor = {
                let mut safety = self.safety.lock().await;
                safety.reload_if_changed(false)?;
                safety::decide_action(
                    &safety,
                    &text,
                    &[],
                    token_count,
                    similarity,
                    self.config.off_topic_cutoff,
                    self.config.low_content_tokens,
                    session.blocks_in_row,
                )
            };

            if monitor.action != MonitorAction::Allow {
                self.sink
                    .record_flag(&InterviewFlag {
                        timestamp: now,
                        session_id: session_id.to_string(),
                        interview_id: session.interview_id.clone(),
                        candidate_id: session.candidate_id.clone(),
                        stage: session.stage,
                        question_id: session.question_id.clone(),
                        action: format!("{:?}", monitor.action),
                        severity: monitor.severity.clone().unwrap_or_else(|| severity_for(&monitor.action)),
                        reason_codes: vec![monitor.reason.clone()],
                        raw_text: text.clone(),
                        safe_reply: monitor.safe_reply.clone(),
                        skip_streak: session.skip_streak,
                        metadata: serde_json::Value::Null,
                    })
                    .await;
            }

            match monitor.action {
                MonitorAction::BlockAndRefocus => {
                    self.flow.on_block(&mut session, monitor.safe_reply.as_deref().unwrap_or(""), &questions).await?
                }
                MonitorAction::Allow => {
                    let intent_result = intent_classifier
                        .classify(stage_label(session.stage), session.question_text.as_deref().unwrap_or(""), &text)
                        .await?;
                    session.latest_intent = Some(format!("{:?}", intent_result.intent));
                    self.flow.decide(&mut session, &intent_result, None, &questions, &evaluator, &hints, now).await?
                }
                MonitorAction::Remind | MonitorAction::Redirect | MonitorAction::NudgeDepth => Decision::new(
                    DecisionTag::Reask,
                    DecisionPayload {
                        text: monitor.safe_reply.clone(),
                        question: self.flow.current_question(&session),
                        quick_actions: flow::default_palette(&session),
                        ..Default::default()
                    },
                ),
            }
        };

        session.record_event("turn_controller", format!("{:?}", decision.tag), start.elapsed().as_millis() as u64);
        self.store.save(&session).await?;
        if let Some(event) = session.event_log.last() {
            self.sink.record_event(session_id, event).await;
        }
        Ok(decision)
    }

    /// Terminate a session (spec §6.2's `finish`): write the final
    /// overall summary, transition to `Complete`, checkpoint, and return
    /// the resulting live scores. Idempotent — calling it again on an
    /// already-`Complete` session just recomputes the same triples.
    pub async fn finish(&self, session_id: &str) -> EngineResult<LiveScores> {
        let _guard = self.store.lock(session_id).await?;
        let mut session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let live_scores = scoring::finalize_overall(&session.score_cache);
        session.stage = Stage::Complete;
        session.question_id = None;
        session.question_text = None;
        session.question_metadata = None;
        session.record_event("turn_controller", "finish", 0);

        self.store.save(&session).await?;
        if let Some(event) = session.event_log.last() {
            self.sink.record_event(session_id, event).await;
        }
        Ok(live_scores)
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<Option<Session>> {
        self.store.load(session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> EngineResult<()> {
        self.store.delete(session_id).await
    }
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Warmup => "warmup",
        Stage::Competency => "competency",
        Stage::Wrapup => "wrapup",
        Stage::Complete => "complete",
    }
}

fn severity_for(action: &MonitorAction) -> String {
    match action {
        MonitorAction::BlockAndRefocus => "high",
        MonitorAction::Redirect => "medium",
        MonitorAction::NudgeDepth | MonitorAction::Remind => "low",
        MonitorAction::Allow => "info",
    }
    .to_string()
}

/// Lexical-overlap stand-in for the monitor's cosine-to-topic check (spec
/// §4.3's `topic_similarity`): Jaccard overlap between the outstanding
/// question's words and the reply's. A real embedding model is out of
/// scope for this engine (see DESIGN.md); an empty question (no turn
/// outstanding yet) never counts as off-topic.
fn topic_similarity(question: &str, reply: &str) -> f64 {
    if question.trim().is_empty() {
        return 1.0;
    }
    let q: std::collections::HashSet<String> = question.split_whitespace().map(|w| w.to_lowercase()).collect();
    let r: std::collections::HashSet<String> = reply.split_whitespace().map(|w| w.to_lowercase()).collect();
    if q.is_empty() || r.is_empty() {
        return 1.0;
    }
    let intersection = q.intersection(&r).count();
    let union = q.union(&r).count();
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}
