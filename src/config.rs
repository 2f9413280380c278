//! Engine configuration — the effect table from spec §4.5, plus paths.
//!
//! Loaded from JSON with `serde_json::from_reader`, mirroring the
//! `agency_models.json` / `Registry` loading pattern the teacher uses for
//! its model registry. `Default` is total: the engine runs with sane
//! thresholds even with no config file present.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap on HINT emissions per stage.
    pub hints_per_stage: u32,
    /// Duration in seconds added by PAUSE_THINK.
    pub think_seconds: i64,
    /// Beyond this followup_index, advance to the next item.
    pub max_followups_per_item: u32,
    /// Consecutive skips that trigger the nudge quick-action row.
    pub nudge_after_consecutive_skips: u32,
    /// Monitor cosine-to-topic threshold below which input is off-topic.
    pub off_topic_cutoff: f64,
    /// Monitor/evaluator brevity threshold, in whitespace-split tokens.
    pub low_content_tokens: u32,
    /// `overall` at/below which a turn counts as a low-score evaluation.
    pub low_score_threshold: f64,
    /// `best_of` at/above which a facet is considered satisfied.
    pub high_satisfied: f64,
    /// Number of warm-up questions before transitioning to the competency stage.
    pub warmup_question_count: u32,
    /// Directory holding per-session checkpoint files.
    pub checkpoint_dir: String,
    /// Path to the safety monitor's hot-reloadable YAML config.
    pub safety_config_path: String,
    /// Additional retries the oracle adapter performs on schema failure.
    pub max_oracle_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hints_per_stage: 2,
            think_seconds: 30,
            max_followups_per_item: 2,
            nudge_after_consecutive_skips: 3,
            off_topic_cutoff: 0.45,
            low_content_tokens: 12,
            low_score_threshold: 2.5,
            high_satisfied: 4.0,
            warmup_question_count: 1,
            checkpoint_dir: "checkpoints".to_string(),
            safety_config_path: "config/safety.yaml".to_string(),
            max_oracle_retries: 2,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            EngineError::ConfigError(format!("failed to open {}: {e}", path.display()))
        })?;
        serde_json::from_reader(file).map_err(|e| {
            EngineError::ConfigError(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_effect_table() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.hints_per_stage, 2);
        assert_eq!(cfg.think_seconds, 30);
        assert_eq!(cfg.max_followups_per_item, 2);
        assert_eq!(cfg.nudge_after_consecutive_skips, 3);
        assert_eq!(cfg.off_topic_cutoff, 0.45);
        assert_eq!(cfg.low_content_tokens, 12);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = EngineConfig::load("/nonexistent/path/engine.json").unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }
}
