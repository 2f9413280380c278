//! End-to-end scenario tests driving the full `Engine` (C10) through the
//! safety/intent/flow pipeline against a scripted oracle transport.
//! These mirror the six concrete scenarios from the interview engine
//! specification's testable-properties section literally: same inputs,
//! same expected decision shapes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tempfile::tempdir;

use interview_orchestrator::config::EngineConfig;
use interview_orchestrator::engine::{Engine, TurnInput};
use interview_orchestrator::llm::{OracleAdapter, OracleRoute, Transport};
use interview_orchestrator::observability::VecSink;
use interview_orchestrator::safety::SafetyEngine;
use interview_orchestrator::session::store::CheckpointStore;
use interview_orchestrator::session::{
    Competency, Criterion, DecisionTag, QuestionMetadata, QuickActionId, QuickActionRequest, Rubric,
    Session, Stage,
};

/// A transport that replies with a canned, per-oracle queue of JSON
/// bodies keyed by the `model` field each `OracleAdapter::execute` call
/// sends — lets each scenario script exactly what each oracle returns
/// without a network. Unscripted calls fall back to `{}`, which in turn
/// exercises this engine's local fallback paths (see `question::mod`,
/// `evaluator::mod`, `intent::mod`).
struct ScriptedOracle {
    queues: StdMutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedOracle {
    fn new() -> Self {
        Self { queues: StdMutex::new(HashMap::new()) }
    }

    fn push(&self, model: &str, reply: &str) {
        self.queues.lock().unwrap().entry(model.to_string()).or_default().push_back(reply.to_string());
    }
}

#[async_trait]
impl Transport for ScriptedOracle {
    async fn post_json(&self, _url: &str, body: Value, _headers: Vec<(String, String)>) -> anyhow::Result<(u16, Value)> {
        let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
        let reply = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&model)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| "{}".to_string());
        Ok((200, serde_json::json!({"choices": [{"message": {"content": reply}}]})))
    }
}

fn route(name: &str) -> OracleRoute {
    OracleRoute::new(name, name, "http://scripted")
}

/// Build an `Engine` with a scripted oracle transport and an isolated
/// checkpoint directory. `safety_yaml` is written verbatim to the
/// engine's safety config path; pass `None` to exercise the
/// no-categories-configured fallback.
fn build_engine(safety_yaml: Option<&str>) -> (Engine, Arc<ScriptedOracle>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let safety_path = dir.path().join("safety.yaml");
    if let Some(yaml) = safety_yaml {
        std::fs::write(&safety_path, yaml).unwrap();
    }

    let config = EngineConfig {
        checkpoint_dir: checkpoint_dir.to_string_lossy().to_string(),
        safety_config_path: safety_path.to_string_lossy().to_string(),
        ..EngineConfig::default()
    };

    let transport = Arc::new(ScriptedOracle::new());
    let adapter = OracleAdapter::new(
        vec![
            route("question_generator"),
            route("evaluator"),
            route("hint_agent"),
            route("intent_classifier"),
        ],
        transport.clone(),
    );
    let safety = SafetyEngine::load(&safety_path).unwrap();
    let engine = Engine::new(config, adapter, safety, Arc::new(VecSink::new()));
    (engine, transport, dir)
}

fn demo_rubric() -> Rubric {
    let anchors = || std::array::from_fn(|_| String::new());
    Rubric {
        competencies: vec![Competency {
            id: "system_design".to_string(),
            name: "System Design".to_string(),
            criteria: vec![
                Criterion {
                    id: "tradeoffs".to_string(),
                    name: "Tradeoff Analysis".to_string(),
                    weight: 0.6,
                    anchors: anchors(),
                },
                Criterion {
                    id: "scalability".to_string(),
                    name: "Scalability".to_string(),
                    weight: 0.4,
                    anchors: anchors(),
                },
            ],
        }],
    }
}

/// A session already mid-competency-stage with one outstanding
/// followup_index=0 question, ready for an answer to arrive.
fn session_with_outstanding_question(session_id: &str) -> Session {
    let mut session = Session::new(session_id, "I1", "C1", None);
    session.rubric = demo_rubric();
    session.stage = Stage::Competency;
    session.current_competency_index = 0;
    session.question_id = Some("system_design-item0-0".to_string());
    session.question_text = Some("Walk me through a system you designed for scale.".to_string());
    session.question_metadata = Some(QuestionMetadata {
        competency_id: "system_design".to_string(),
        item_id: "system_design-item0".to_string(),
        facet_id: "tradeoffs".to_string(),
        facet_name: "Tradeoff Analysis".to_string(),
        followup_index: 0,
        evidence_targets: vec!["tradeoffs".to_string()],
    });
    session
}

// ---------------------------------------------------------------------
// Scenario 1: first turn after start.
// ---------------------------------------------------------------------
#[tokio::test]
async fn first_turn_after_start_asks_warmup_question() {
    let (engine, transport, dir) = build_engine(None);
    transport.push(
        "question_generator",
        r#"{"persona_brief":"warm","draft_question":"Tell me about a project you're proud of and its outcome.","tone":"warm","targeted_criteria":["WU1"]}"#,
    );

    let (session_id, decision) = engine.start("I1", "C1", Rubric::default(), None).await.unwrap();

    assert_eq!(decision.tag, DecisionTag::Ask);
    let question = decision.payload.question.expect("ASK must carry a question");
    assert_eq!(question.metadata.followup_index, 0);
    assert!(question.text.contains("project"));

    let checkpoint_path = dir.path().join("checkpoints").join(format!("{session_id}.json"));
    assert!(checkpoint_path.exists(), "checkpoint must be written at <base_dir>/<session_id>.json");
}

// ---------------------------------------------------------------------
// Scenario 2: an answer to an outstanding question scoring below the
// high-satisfied threshold triggers a followup (ASK, followup_index=1).
// ---------------------------------------------------------------------
#[tokio::test]
async fn answer_below_high_satisfied_triggers_followup() {
    let (engine, transport, dir) = build_engine(None);
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let session = session_with_outstanding_question("s-followup");
    store.save(&session).await.unwrap();

    transport.push(
        "intent_classifier",
        r#"{"intent":"answer","confidence":0.95,"rationale":"looks like a direct answer"}"#,
    );
    transport.push(
        "evaluator",
        r#"{"updated_summary":"led a migration with clear milestones","criterion_scores":{"tradeoffs":4,"scalability":3},"notes":"solid narrative, could quantify tradeoffs more"}"#,
    );
    transport.push(
        "question_generator",
        r#"{"persona_brief":"probe","draft_question":"What tradeoffs did you weigh between cost and latency there?","tone":"curious","targeted_criteria":["tradeoffs"]}"#,
    );

    let input = TurnInput {
        text: Some("I led migration by planning milestones, coordinating engineers, delivering measurable impact".to_string()),
        quick_action: None,
        client_ts: None,
    };
    let decision = engine.turn("s-followup", input).await.unwrap();

    assert_eq!(decision.tag, DecisionTag::Ask);
    let eval = decision.payload.eval.expect("ASK-after-answer carries the eval that produced it");
    assert!(eval.overall < 4.0, "overall {} must be below HIGH_SATISFIED to trigger a followup", eval.overall);
    let question = decision.payload.question.unwrap();
    assert_eq!(question.metadata.followup_index, 1);

    let reloaded = store.load("s-followup").await.unwrap().unwrap();
    assert_eq!(reloaded.score_cache.competencies["system_design"].items["system_design-item0"].best_of, eval.overall);
}

// ---------------------------------------------------------------------
// Scenario 3: a quick action arriving with free text in the same turn is
// not dropped — it is queued and drained by the next (input-less) turn.
// ---------------------------------------------------------------------
#[tokio::test]
async fn quick_action_with_text_queues_and_drains_on_next_turn() {
    let (engine, transport, dir) = build_engine(None);
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let session = session_with_outstanding_question("s-queue");
    store.save(&session).await.unwrap();

    let first = TurnInput {
        text: Some("answer with depth".to_string()),
        quick_action: Some(QuickActionRequest { id: QuickActionId::Repeat, note: None }),
        client_ts: None,
    };
    let first_decision = engine.turn("s-queue", first).await.unwrap();
    assert_eq!(first_decision.tag, DecisionTag::Reask);

    let queued = store.load("s-queue").await.unwrap().unwrap();
    assert_eq!(queued.queued_user_msg.as_deref(), Some("answer with depth"));

    transport.push(
        "intent_classifier",
        r#"{"intent":"answer","confidence":0.95,"rationale":"direct answer"}"#,
    );
    transport.push(
        "evaluator",
        r#"{"updated_summary":"answered with depth","criterion_scores":{"tradeoffs":5},"notes":"thorough"}"#,
    );

    let second = TurnInput { text: None, quick_action: None, client_ts: None };
    let second_decision = engine.turn("s-queue", second).await.unwrap();
    assert!(matches!(second_decision.tag, DecisionTag::Ask | DecisionTag::EvalAndAskNext));

    let drained = store.load("s-queue").await.unwrap().unwrap();
    assert!(drained.queued_user_msg.is_none(), "queue must be drained after the follow-up turn");
}

// ---------------------------------------------------------------------
// Scenario 4: three consecutive blocks force AUTO_SKIP_MOVED and reset
// blocks_in_row.
// ---------------------------------------------------------------------
#[tokio::test]
async fn three_consecutive_blocks_force_auto_skip() {
    let safety_yaml = r#"
precedence: [unsafe, jailbreak, pii, offtopic, low_content]
categories:
  unsafe:
    severity: high
    patterns: ["rm -rf"]
allow_lists: {}
normalizers: [to_lower]
"#;
    let (engine, transport, dir) = build_engine(Some(safety_yaml));
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let session = session_with_outstanding_question("s-blocks");
    store.save(&session).await.unwrap();

    transport.push(
        "question_generator",
        r#"{"persona_brief":"x","draft_question":"Let's try a different angle on scale.","tone":"neutral","targeted_criteria":["tradeoffs"]}"#,
    );

    let unsafe_input = || TurnInput { text: Some("just rm -rf / the whole thing".to_string()), quick_action: None, client_ts: None };

    let d1 = engine.turn("s-blocks", unsafe_input()).await.unwrap();
    assert_eq!(d1.tag, DecisionTag::Reask);
    let d2 = engine.turn("s-blocks", unsafe_input()).await.unwrap();
    assert_eq!(d2.tag, DecisionTag::Reask);
    let d3 = engine.turn("s-blocks", unsafe_input()).await.unwrap();
    assert_eq!(d3.tag, DecisionTag::AutoSkipMoved);

    let reloaded = store.load("s-blocks").await.unwrap().unwrap();
    assert_eq!(reloaded.blocks_in_row, 0, "blocks_in_row must reset to 0 after AUTO_SKIP_MOVED (I4)");
}

// ---------------------------------------------------------------------
// Scenario 5: think-timer expiry is checked on every turn entry, before
// the pipeline runs, and clears think_until unconditionally.
// ---------------------------------------------------------------------
#[tokio::test]
async fn expired_think_timer_short_circuits_the_pipeline() {
    let (engine, _transport, dir) = build_engine(None);
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let mut session = session_with_outstanding_question("s-think");
    session.think_until = Some(Utc::now() - Duration::seconds(1));
    store.save(&session).await.unwrap();

    let input = TurnInput { text: None, quick_action: None, client_ts: None };
    let decision = engine.turn("s-think", input).await.unwrap();

    assert_eq!(decision.tag, DecisionTag::Reask);
    assert!(decision.payload.question.is_some(), "resume must rehydrate the outstanding question");

    let reloaded = store.load("s-think").await.unwrap().unwrap();
    assert!(reloaded.think_until.is_none(), "think_until must be cleared in the checkpoint after expiry");
}

// ---------------------------------------------------------------------
// Scenario 6: hint exhaustion at hints_per_stage=2.
// ---------------------------------------------------------------------
#[tokio::test]
async fn hint_exhausts_after_configured_cap() {
    let dir = tempdir().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let safety_path = dir.path().join("safety.yaml");
    let config = EngineConfig {
        checkpoint_dir: checkpoint_dir.to_string_lossy().to_string(),
        safety_config_path: safety_path.to_string_lossy().to_string(),
        hints_per_stage: 2,
        ..EngineConfig::default()
    };
    let transport = Arc::new(ScriptedOracle::new());
    let adapter = OracleAdapter::new(
        vec![route("question_generator"), route("evaluator"), route("hint_agent"), route("intent_classifier")],
        transport.clone(),
    );
    let safety = SafetyEngine::load(&safety_path).unwrap();
    let engine = Engine::new(config, adapter, safety, Arc::new(VecSink::new()));

    let store = CheckpointStore::new(&checkpoint_dir);
    let session = session_with_outstanding_question("s-hint");
    store.save(&session).await.unwrap();

    for i in 0..3 {
        transport.push("intent_classifier", r#"{"intent":"ask_hint","confidence":0.9,"rationale":"wants a nudge"}"#);
        transport.push("hint_agent", &format!(r#"{{"hint":"hint number {i}"}}"#));
        let input = TurnInput { text: Some("can I get a hint".to_string()), quick_action: None, client_ts: None };
        let decision = engine.turn("s-hint", input).await.unwrap();
        assert_eq!(decision.tag, DecisionTag::Hint);
        match i {
            0 | 1 => assert!(!decision.payload.exhausted, "hint {i} must not be exhausted yet"),
            _ => assert!(decision.payload.exhausted, "third hint request must report exhausted"),
        }
    }

    let reloaded = store.load("s-hint").await.unwrap().unwrap();
    assert_eq!(reloaded.hints_used_stage, 2, "hints_used_stage caps at hints_per_stage, never advances past it");
}
