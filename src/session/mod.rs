//! Session data model (spec §3) — the state every pipeline stage reads and
//! mutates. Grounded on the teacher's `orchestrator/session.rs`
//! (`SessionState`/`SessionManager` persistence shape) and
//! `memory/episodic.rs` (sliding-window transcript pattern), generalized to
//! the richer per-session record the interview engine needs.

pub mod store;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bound on the number of previously emitted hints retained per facet (I6-adjacent).
pub const HINT_HISTORY_CAP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Warmup,
    Competency,
    Wrapup,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Low,
    Mid,
    High,
}

impl Band {
    pub fn from_overall(overall: f64) -> Self {
        if overall <= 2.0 {
            Band::Low
        } else if overall < 4.0 {
            Band::Mid
        } else {
            Band::High
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickActionId {
    Hint,
    Think30,
    Repeat,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickActionRequest {
    pub id: QuickActionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Answer,
    AskHint,
    AskClarify,
    AskPause,
    AskThink,
    Other,
}

/// A single weighted rubric criterion with its five level anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub name: String,
    /// Not required to sum to 1 across a competency; the aggregator
    /// normalizes by total weight (spec §3).
    pub weight: f64,
    /// Anchor text for levels 1..5, indexed `anchors[level - 1]`.
    pub anchors: [String; 5],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Competency {
    pub id: String,
    pub name: String,
    pub criteria: Vec<Criterion>,
}

impl Competency {
    pub fn total_weight(&self) -> f64 {
        self.criteria.iter().map(|c| c.weight).sum()
    }

    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rubric {
    pub competencies: Vec<Competency>,
}

impl Rubric {
    pub fn competency(&self, id: &str) -> Option<&Competency> {
        self.competencies.iter().find(|c| c.id == id)
    }

    pub fn competency_index(&self, id: &str) -> Option<usize> {
        self.competencies.iter().position(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionMetadata {
    pub competency_id: String,
    pub item_id: String,
    pub facet_id: String,
    pub facet_name: String,
    /// 0 for the base question of an item, 1-2 for deeper probes (I1).
    pub followup_index: u8,
    pub evidence_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub metadata: QuestionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub competency_id: String,
    pub item_id: String,
    pub turn_index: u32,
    /// criterion id -> integer score 1..5
    pub criterion_scores: HashMap<String, u8>,
    pub overall: f64,
    pub band: Band,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ScoresTriple {
    pub avg: f64,
    pub median: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveScores {
    pub per_competency: HashMap<String, ScoresTriple>,
    pub overall: ScoresTriple,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemScoreEntry {
    pub turns: Vec<EvalResult>,
    /// Monotonic nondecreasing maximum `overall` ever recorded (I2).
    pub best_of: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompetencyScoreBucket {
    pub items: HashMap<String, ItemScoreEntry>,
    pub skipped_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreCache {
    pub competencies: HashMap<String, CompetencyScoreBucket>,
}

/// Running per-competency progress used by the Flow Manager to decide
/// when to advance (spec §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompetencyProgress {
    pub covered_criteria: Vec<String>,
    pub question_index: u32,
    pub low_score_counter: u32,
}

/// Evaluator's running memory: a textual summary plus monotonic
/// per-competency best-known criterion levels (I3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorMemory {
    pub summary: String,
    /// competency_id -> criterion_id -> level (0..5), nondecreasing.
    pub criterion_levels: HashMap<String, HashMap<String, u8>>,
}

impl EvaluatorMemory {
    /// Raise a criterion's known level, never lowering it (I3).
    pub fn raise_level(&mut self, competency_id: &str, criterion_id: &str, level: u8) {
        let bucket = self.criterion_levels.entry(competency_id.to_string()).or_default();
        let entry = bucket.entry(criterion_id.to_string()).or_insert(0);
        if level > *entry {
            *entry = level;
        }
    }

    pub fn level(&self, competency_id: &str, criterion_id: &str) -> u8 {
        self.criterion_levels
            .get(competency_id)
            .and_then(|m| m.get(criterion_id))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub node: String,
    pub decision: String,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTag {
    Ask,
    Reask,
    Hint,
    PauseThink,
    SkipAndNext,
    EvalAndAskNext,
    AutoSkipMoved,
    Clarify,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval: Option<EvalResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_scores: Option<LiveScores>,
    pub quick_actions: Vec<QuickActionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think_until: Option<DateTime<Utc>>,
    /// Set for HINT decisions once the per-stage cap has been reached.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub tag: DecisionTag,
    pub payload: DecisionPayload,
}

impl Decision {
    pub fn new(tag: DecisionTag, payload: DecisionPayload) -> Self {
        Self { tag, payload }
    }
}

/// The full per-session record (spec §3). Mutated only by the Turn
/// Controller under the per-session lock from `store::CheckpointStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub interview_id: String,
    pub candidate_id: String,
    pub persona: String,

    pub stage: Stage,

    pub question_id: Option<String>,
    pub question_text: Option<String>,
    pub question_metadata: Option<QuestionMetadata>,

    pub skip_streak: u32,
    pub blocks_in_row: u32,
    pub hints_used_stage: u32,

    pub user_msg: Option<String>,
    pub queued_user_msg: Option<String>,
    pub quick_action: Option<QuickActionRequest>,
    pub client_ts: Option<String>,
    pub latest_intent: Option<String>,

    pub think_until: Option<DateTime<Utc>>,

    pub rubric: Rubric,
    pub score_cache: ScoreCache,
    pub event_log: Vec<EventRecord>,
    pub hint_history: HashMap<String, VecDeque<String>>,
    pub evaluator_memory: EvaluatorMemory,

    /// Index of the currently active competency within `rubric.competencies`.
    pub current_competency_index: usize,
    /// Index of the currently active item within the current competency (spec
    /// treats items implicitly via `question_metadata.item_id`; this tracks
    /// ordinal progress for stage-advance bookkeeping).
    pub current_item_index: usize,
    pub competency_progress: HashMap<String, CompetencyProgress>,

    pub turn_counter: u32,
}

impl Session {
    pub fn new(session_id: impl Into<String>, interview_id: impl Into<String>, candidate_id: impl Into<String>, persona: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            interview_id: interview_id.into(),
            candidate_id: candidate_id.into(),
            persona: persona.unwrap_or_else(|| "Friendly Expert".to_string()),
            stage: Stage::Warmup,
            question_id: None,
            question_text: None,
            question_metadata: None,
            skip_streak: 0,
            blocks_in_row: 0,
            hints_used_stage: 0,
            user_msg: None,
            queued_user_msg: None,
            quick_action: None,
            client_ts: None,
            latest_intent: None,
            think_until: None,
            rubric: Rubric::default(),
            score_cache: ScoreCache::default(),
            event_log: Vec::new(),
            hint_history: HashMap::new(),
            evaluator_memory: EvaluatorMemory::default(),
            current_competency_index: 0,
            current_item_index: 0,
            competency_progress: HashMap::new(),
            turn_counter: 0,
        }
    }

    pub fn record_event(&mut self, node: impl Into<String>, decision: impl Into<String>, latency_ms: u64) {
        self.event_log.push(EventRecord {
            node: node.into(),
            decision: decision.into(),
            latency_ms,
            timestamp: Utc::now(),
        });
    }

    /// Push a hint onto a facet's bounded history (last `HINT_HISTORY_CAP`).
    pub fn push_hint(&mut self, facet_id: &str, hint: String) {
        let entry = self.hint_history.entry(facet_id.to_string()).or_default();
        entry.push_back(hint);
        while entry.len() > HINT_HISTORY_CAP {
            entry.pop_front();
        }
    }

    pub fn current_competency(&self) -> Option<&Competency> {
        self.rubric.competencies.get(self.current_competency_index)
    }

    /// I4: blocks_in_row resets on ALLOW, increments on BLOCK_AND_REFOCUS,
    /// forces AUTO_SKIP_MOVED at 3 and resets.
    pub fn register_block(&mut self) -> bool {
        self.blocks_in_row += 1;
        self.blocks_in_row >= 3
    }

    pub fn reset_blocks(&mut self) {
        self.blocks_in_row = 0;
    }

    /// I5: skip_streak resets whenever a new ASK/EVAL_AND_ASK_NEXT/
    /// AUTO_SKIP_MOVED is emitted AND the nudge threshold has been reached.
    pub fn maybe_absorb_nudge(&mut self, nudge_after_consecutive_skips: u32) {
        if self.skip_streak >= nudge_after_consecutive_skips {
            self.skip_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluator_memory_level_is_monotonic() {
        let mut mem = EvaluatorMemory::default();
        mem.raise_level("comp1", "crit1", 3);
        mem.raise_level("comp1", "crit1", 2);
        assert_eq!(mem.level("comp1", "crit1"), 3, "level must never decrease");
        mem.raise_level("comp1", "crit1", 4);
        assert_eq!(mem.level("comp1", "crit1"), 4);
    }

    #[test]
    fn hint_history_bounded_to_five() {
        let mut session = Session::new("s1", "i1", "c1", None);
        for i in 0..8 {
            session.push_hint("facet-a", format!("hint {i}"));
        }
        assert_eq!(session.hint_history.get("facet-a").unwrap().len(), HINT_HISTORY_CAP);
        assert_eq!(session.hint_history["facet-a"].front().unwrap(), "hint 3");
    }

    #[test]
    fn block_runaway_trips_at_three() {
        let mut session = Session::new("s1", "i1", "c1", None);
        assert!(!session.register_block());
        assert!(!session.register_block());
        assert!(session.register_block());
    }

    #[test]
    fn band_thresholds() {
        assert_eq!(Band::from_overall(1.0), Band::Low);
        assert_eq!(Band::from_overall(2.0), Band::Low);
        assert_eq!(Band::from_overall(2.1), Band::Mid);
        assert_eq!(Band::from_overall(3.9), Band::Mid);
        assert_eq!(Band::from_overall(4.0), Band::High);
    }
}
