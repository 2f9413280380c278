//! Observability sinks (spec §6.4) — an injectable seam for turn-level
//! telemetry, separate from the `tracing` spans every module already
//! emits. Grounded on the teacher's `agent::provider::PublishingProvider`
//! (a broadcast-channel wrapper around another provider) for the pattern
//! of "observe alongside the real work without changing its contract."
//!
//! SQLite persistence for these writes is explicitly out of scope (spec
//! §1's Non-goals); the sink *interface* is ambient observability
//! plumbing the Non-goal doesn't exclude, so a default `TracingSink`
//! logs through `tracing` and tests use an in-memory `VecSink`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::session::{EventRecord, Stage};

/// One row for every non-ALLOW safety monitor outcome (spec §6.4).
#[derive(Debug, Clone, Serialize)]
pub struct InterviewFlag {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub interview_id: String,
    pub candidate_id: String,
    pub stage: Stage,
    pub question_id: Option<String>,
    pub action: String,
    pub severity: String,
    pub reason_codes: Vec<String>,
    pub raw_text: String,
    pub safe_reply: Option<String>,
    pub skip_streak: u32,
    pub metadata: Value,
}

/// One row for every logged quick action, whether explicit or
/// intent-driven (spec §6.4).
#[derive(Debug, Clone, Serialize)]
pub struct QuickActionLog {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub interview_id: String,
    pub candidate_id: String,
    pub stage: Stage,
    pub question_id: Option<String>,
    pub action_id: String,
    pub source: String,
    pub latency_ms: Option<u64>,
    pub metadata: Value,
}

#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn record_event(&self, session_id: &str, event: &EventRecord);

    /// Default no-op so sinks that only care about event-log telemetry
    /// don't have to implement every method.
    async fn record_flag(&self, _flag: &InterviewFlag) {}

    async fn record_quick_action(&self, _log: &QuickActionLog) {}
}

/// Forwards every event through `tracing::info!`, matching the density
/// the rest of the crate already uses for structured logs.
pub struct TracingSink;

#[async_trait]
impl ObservabilitySink for TracingSink {
    async fn record_event(&self, session_id: &str, event: &EventRecord) {
        tracing::info!(
            session_id,
            node = %event.node,
            decision = %event.decision,
            latency_ms = event.latency_ms,
            "turn event"
        );
    }

    async fn record_flag(&self, flag: &InterviewFlag) {
        tracing::warn!(
            session_id = %flag.session_id,
            action = %flag.action,
            severity = %flag.severity,
            reason_codes = ?flag.reason_codes,
            skip_streak = flag.skip_streak,
            "interview flag"
        );
    }

    async fn record_quick_action(&self, log: &QuickActionLog) {
        tracing::info!(
            session_id = %log.session_id,
            action_id = %log.action_id,
            source = %log.source,
            latency_ms = ?log.latency_ms,
            "quick action"
        );
    }
}

/// Broadcasts events to any number of subscribers (test harnesses, a
/// future live-dashboard client) without blocking the turn on a slow
/// reader — mirrors the teacher's `PublishingProvider` channel shape.
pub struct BroadcastSink {
    sender: broadcast::Sender<(String, EventRecord)>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, EventRecord)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl ObservabilitySink for BroadcastSink {
    async fn record_event(&self, session_id: &str, event: &EventRecord) {
        let _ = self.sender.send((session_id.to_string(), event.clone()));
    }
}

/// In-memory sink for tests: records everything it is handed so
/// assertions can inspect the full telemetry trail of a turn.
#[derive(Default)]
pub struct VecSink {
    pub events: Mutex<Vec<(String, EventRecord)>>,
    pub flags: Mutex<Vec<InterviewFlag>>,
    pub quick_actions: Mutex<Vec<QuickActionLog>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObservabilitySink for VecSink {
    async fn record_event(&self, session_id: &str, event: &EventRecord) {
        self.events.lock().await.push((session_id.to_string(), event.clone()));
    }

    async fn record_flag(&self, flag: &InterviewFlag) {
        self.flags.lock().await.push(flag.clone());
    }

    async fn record_quick_action(&self, log: &QuickActionLog) {
        self.quick_actions.lock().await.push(log.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event() -> EventRecord {
        EventRecord {
            node: "flow".to_string(),
            decision: "ask".to_string(),
            latency_ms: 12,
            timestamp: Utc::now(),
        }
    }

    fn sample_flag() -> InterviewFlag {
        InterviewFlag {
            timestamp: Utc::now(),
            session_id: "sess-1".to_string(),
            interview_id: "I1".to_string(),
            candidate_id: "C1".to_string(),
            stage: Stage::Competency,
            question_id: Some("q1".to_string()),
            action: "redirect".to_string(),
            severity: "medium".to_string(),
            reason_codes: vec!["off_topic".to_string()],
            raw_text: "let's talk about cooking".to_string(),
            safe_reply: Some("let's refocus".to_string()),
            skip_streak: 0,
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscriber() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.record_event("sess-1", &sample_event()).await;
        let (session_id, event) = rx.recv().await.unwrap();
        assert_eq!(session_id, "sess-1");
        assert_eq!(event.node, "flow");
    }

    #[tokio::test]
    async fn vec_sink_records_flags_and_quick_actions() {
        let sink = VecSink::new();
        sink.record_flag(&sample_flag()).await;
        assert_eq!(sink.flags.lock().await.len(), 1);
        assert!(sink.quick_actions.lock().await.is_empty());
    }
}
