//! Standalone demo harness for the interview engine: runs one interview
//! over stdin/stdout against an OpenAI-compatible chat endpoint. Mirrors
//! the teacher's `main.rs` startup shape (tracing init, one long-lived
//! collaborator graph, a blocking stdin loop) without its multi-agent
//! tool registry, which this engine has no use for.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use interview_orchestrator::config::EngineConfig;
use interview_orchestrator::engine::{Engine, TurnInput};
use interview_orchestrator::llm::{OracleAdapter, OracleRoute, ReqwestTransport};
use interview_orchestrator::observability::TracingSink;
use interview_orchestrator::safety::SafetyEngine;
use interview_orchestrator::session::{Competency, Criterion, Rubric};
use tracing_subscriber::EnvFilter;

fn demo_rubric() -> Rubric {
    let anchors = |labels: [&str; 5]| -> [String; 5] { labels.map(|s| s.to_string()) };
    Rubric {
        competencies: vec![
            Competency {
                id: "system_design".to_string(),
                name: "System Design".to_string(),
                criteria: vec![
                    Criterion {
                        id: "tradeoffs".to_string(),
                        name: "Tradeoff Analysis".to_string(),
                        weight: 1.0,
                        anchors: anchors([
                            "No tradeoffs considered",
                            "Names one option",
                            "Compares two options",
                            "Weighs cost/latency/complexity",
                            "Quantifies tradeoffs with data",
                        ]),
                    },
                    Criterion {
                        id: "scalability".to_string(),
                        name: "Scalability".to_string(),
                        weight: 1.0,
                        anchors: anchors([
                            "No scale considerations",
                            "Mentions scale in passing",
                            "Identifies a bottleneck",
                            "Proposes a mitigation",
                            "Proposes and validates a mitigation",
                        ]),
                    },
                ],
            },
            Competency {
                id: "debugging".to_string(),
                name: "Debugging".to_string(),
                criteria: vec![Criterion {
                    id: "root_cause".to_string(),
                    name: "Root Cause Analysis".to_string(),
                    weight: 1.0,
                    anchors: anchors([
                        "No investigation described",
                        "Describes symptoms only",
                        "Narrows to a subsystem",
                        "Identifies the root cause",
                        "Identifies root cause and verifies the fix",
                    ]),
                }],
            },
        ],
    }
}

fn build_adapter() -> OracleAdapter {
    let base_url = std::env::var("ORACLE_BASE_URL").unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
    let model = std::env::var("ORACLE_MODEL").unwrap_or_else(|_| "llama3".to_string());

    let route = |name: &str, sequential: bool| {
        let mut route = OracleRoute::new(name, model.clone(), base_url.clone());
        if sequential {
            route = route.sequential();
        }
        route
    };

    OracleAdapter::new(
        vec![
            // Question generation and evaluation share one model context
            // per candidate, so both are sequential (spec §4.2).
            route("question_generator", true),
            route("evaluator", true),
            route("hint_agent", false),
            route("intent_classifier", false),
        ],
        Arc::new(ReqwestTransport::new()),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = EngineConfig::default();
    let safety = SafetyEngine::load(&config.safety_config_path)?;
    let adapter = build_adapter();
    let engine = Engine::new(config, adapter, safety, Arc::new(TracingSink));

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    println!("Interview Orchestration Engine — demo CLI");
    println!("Type your answers at the prompt. Type 'quit' to stop.\n");

    let (session_id, opening) = engine.start("demo-interview", "demo-candidate", demo_rubric(), None).await?;
    print_decision(&opening);

    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        if line.trim().eq_ignore_ascii_case("quit") {
            break;
        }

        let input = TurnInput { text: Some(line), quick_action: None, client_ts: None };
        let decision = engine.turn(&session_id, input).await?;
        print_decision(&decision);
    }

    let scores = engine.finish(&session_id).await?;
    println!("\nFinal scores: {:#?}", scores);
    Ok(())
}

fn print_decision(decision: &interview_orchestrator::Decision) {
    if let Some(question) = &decision.payload.question {
        println!("\n{}", question.text);
    } else if let Some(text) = &decision.payload.text {
        println!("\n{text}");
    }
    if !decision.payload.quick_actions.is_empty() {
        println!("[actions: {:?}]", decision.payload.quick_actions);
    }
}
