//! Safety Monitor (C3) — regex-category matcher with precedence-ordered
//! winning category, allow-list suppression, and mtime-gated hot reload.
//!
//! Grounded on the teacher's `safety/content_filter.rs` (`Vec<(Regex,
//! String)>` category tables, `ContentFilterResult` shape) for the Rust
//! idiom, and on `original_source/config/safety.py::SafetyEngine` for the
//! exact algorithm: normalize → scan every compiled category → allow-list
//! short-circuit → pick the lowest-precedence-index matching category as
//! the winner (spec §4.3).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Deserialize)]
struct CategoryDef {
    #[serde(default)]
    severity: String,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SafetyConfigFile {
    #[serde(default)]
    precedence: Vec<String>,
    #[serde(default)]
    categories: HashMap<String, CategoryDef>,
    #[serde(default)]
    allow_lists: HashMap<String, Vec<String>>,
    #[serde(default)]
    normalizers: Vec<String>,
}

impl Default for SafetyConfigFile {
    fn default() -> Self {
        Self {
            precedence: vec![
                "unsafe".to_string(),
                "jailbreak".to_string(),
                "pii".to_string(),
                "offtopic".to_string(),
                "low_content".to_string(),
            ],
            categories: HashMap::new(),
            allow_lists: HashMap::new(),
            normalizers: vec![
                "strip_whitespace".to_string(),
                "collapse_spaces".to_string(),
                "to_lower".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchHit {
    pub category: String,
    pub pattern: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, Default)]
pub struct SafetyFinding {
    pub category: Option<String>,
    pub severity: String,
    pub hits: Vec<MatchHit>,
    pub allow_list_reason: Option<String>,
}

impl SafetyFinding {
    pub fn clean() -> Self {
        Self { severity: "info".to_string(), ..Default::default() }
    }
}

/// Compiled regex categories plus the allow-list/precedence tables, with
/// lazy reload when the backing YAML file's mtime advances.
pub struct SafetyEngine {
    path: PathBuf,
    mtime: Option<SystemTime>,
    precedence: Vec<String>,
    severity: HashMap<String, String>,
    allow_lists: HashMap<String, Vec<String>>,
    normalizers: Vec<String>,
    compiled: HashMap<String, Vec<Regex>>,
}

impl SafetyEngine {
    pub fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let mut engine = Self {
            path: path.into(),
            mtime: None,
            precedence: Vec::new(),
            severity: HashMap::new(),
            allow_lists: HashMap::new(),
            normalizers: Vec::new(),
            compiled: HashMap::new(),
        };
        engine.reload_if_changed(true)?;
        Ok(engine)
    }

    /// Reload the backing YAML when its mtime has advanced, or when
    /// `force` is set. A missing file falls back to the built-in default
    /// category set rather than failing the whole engine (spec §4.3: the
    /// monitor must degrade, not crash, when config is absent).
    pub fn reload_if_changed(&mut self, force: bool) -> EngineResult<()> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => {
                if self.mtime.is_none() {
                    self.apply(SafetyConfigFile::default())?;
                    self.mtime = Some(SystemTime::UNIX_EPOCH);
                }
                return Ok(());
            }
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if !force {
            if let Some(prev) = self.mtime {
                if modified <= prev {
                    return Ok(());
                }
            }
        }

        let raw = fs::read_to_string(&self.path)
            .map_err(|e| EngineError::ConfigError(format!("reading safety config: {e}")))?;
        let parsed: SafetyConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::ConfigError(format!("parsing safety config: {e}")))?;
        self.apply(parsed)?;
        self.mtime = Some(modified);
        Ok(())
    }

    fn apply(&mut self, cfg: SafetyConfigFile) -> EngineResult<()> {
        let mut compiled = HashMap::new();
        let mut severity = HashMap::new();
        for (name, def) in &cfg.categories {
            let mut patterns = Vec::with_capacity(def.patterns.len());
            for p in &def.patterns {
                let re = Regex::new(p)
                    .map_err(|e| EngineError::ConfigError(format!("bad safety pattern `{p}`: {e}")))?;
                patterns.push(re);
            }
            compiled.insert(name.clone(), patterns);
            severity.insert(name.clone(), if def.severity.is_empty() { "info".to_string() } else { def.severity.clone() });
        }
        self.precedence = cfg.precedence;
        self.severity = severity;
        self.allow_lists = cfg.allow_lists;
        self.normalizers = cfg.normalizers;
        self.compiled = compiled;
        Ok(())
    }

    fn normalize(&self, text: &str) -> String {
        let mut sample = text.to_string();
        if self.normalizers.iter().any(|n| n == "strip_whitespace") {
            sample = sample.trim().to_string();
        }
        if self.normalizers.iter().any(|n| n == "collapse_spaces") {
            sample = sample.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        if self.normalizers.iter().any(|n| n == "to_lower") {
            sample = sample.to_lowercase();
        }
        sample
    }

    fn allow_ok(&self, token: &str, context_tags: &[String]) -> bool {
        let normal_token = self.normalize(token);
        for (tag, terms) in &self.allow_lists {
            if context_tags.iter().any(|t| t == tag) {
                if terms.iter().any(|term| self.normalize(term) == normal_token) {
                    return true;
                }
            }
        }
        false
    }

    /// Flattened, de-duplicated allow-list terms, for exposure in prompts
    /// or telemetry (spec §11 supplement: "allow-list term export").
    pub fn allow_terms(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for terms in self.allow_lists.values() {
            for term in terms {
                if seen.insert(term.clone()) {
                    out.push(term.clone());
                }
            }
        }
        out
    }

    /// Scan `text`, returning the single winning category finding, or a
    /// clean finding if nothing matched (or an allow-listed match fired).
    pub fn analyze(&self, text: &str, context_tags: &[String]) -> SafetyFinding {
        let sample = self.normalize(text);
        let mut matches: Vec<MatchHit> = Vec::new();

        for (category, patterns) in &self.compiled {
            for pattern in patterns {
                for m in pattern.find_iter(&sample) {
                    let token = m.as_str();
                    if self.allow_ok(token, context_tags) {
                        return SafetyFinding {
                            category: None,
                            severity: "info".to_string(),
                            hits: Vec::new(),
                            allow_list_reason: Some(format!("allowed by {context_tags:?}")),
                        };
                    }
                    matches.push(MatchHit {
                        category: category.clone(),
                        pattern: pattern.as_str().to_string(),
                        excerpt: excerpt_around(&sample, m.start(), m.end(), 20),
                    });
                }
            }
        }

        if matches.is_empty() {
            return SafetyFinding::clean();
        }

        let precedence_lookup: HashMap<&str, usize> =
            self.precedence.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        let winning_category = matches
            .iter()
            .min_by_key(|hit| precedence_lookup.get(hit.category.as_str()).copied().unwrap_or(usize::MAX))
            .map(|hit| hit.category.clone())
            .expect("matches is non-empty");

        let severity = self.severity.get(&winning_category).cloned().unwrap_or_else(|| "info".to_string());
        let top_hits: Vec<MatchHit> = matches.into_iter().filter(|h| h.category == winning_category).collect();

        SafetyFinding {
            category: Some(winning_category),
            severity,
            hits: top_hits,
            allow_list_reason: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `text[start.saturating_sub(pad)..(end+pad).min(len)]`, widened outward
/// to the nearest char boundary so a multi-byte character straddling the
/// window edge doesn't panic the slice.
fn excerpt_around(text: &str, start: usize, end: usize, pad: usize) -> String {
    let mut lo = start.saturating_sub(pad);
    while lo > 0 && !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + pad).min(text.len());
    while hi < text.len() && !text.is_char_boundary(hi) {
        hi += 1;
    }
    text[lo..hi].to_string()
}

/// Result of the full behavior-monitor pass over one turn's input,
/// combining the regex finding with the heuristics the monitor also
/// checks (silence, brevity, topic drift) — spec §4.3's `MonitorResult`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    Allow,
    Remind,
    BlockAndRefocus,
    Redirect,
    NudgeDepth,
}

#[derive(Debug, Clone)]
pub struct MonitorResult {
    pub action: MonitorAction,
    pub reason: String,
    pub safe_reply: Option<String>,
    /// Set for categories whose severity the monitor itself resolves
    /// (unsafe/jailbreak's block-streak escalation); `None` leaves the
    /// caller to fall back to its own action-based mapping.
    pub severity: Option<String>,
}

/// `unsafe` is always critical; `jailbreak` escalates to critical once
/// the candidate has been blocked on consecutive turns (spec §4.3,
/// `original_source/agents/behavior_monitor.py::choose_severity`).
fn block_severity(category: &str, blocks_in_row: u32) -> &'static str {
    match category {
        "unsafe" => "critical",
        "jailbreak" => {
            if blocks_in_row >= 2 {
                "critical"
            } else {
                "high"
            }
        }
        _ => "high",
    }
}

/// Apply the branch order from spec §4.3 / the behavior monitor's
/// original algorithm: silence first, then unsafe/jailbreak, then pii,
/// then off-topic category, then cosine off-topic, then low-content,
/// defaulting to ALLOW. `blocks_in_row` is the candidate's current
/// consecutive-block streak going into this turn, used to escalate
/// jailbreak severity.
pub fn decide_action(
    engine: &SafetyEngine,
    text: &str,
    context_tags: &[String],
    token_count: u32,
    topic_similarity: f64,
    off_topic_cutoff: f64,
    low_content_tokens: u32,
    blocks_in_row: u32,
) -> MonitorResult {
    if text.trim().is_empty() {
        return MonitorResult {
            action: MonitorAction::Remind,
            reason: "empty input".to_string(),
            safe_reply: Some("I didn't receive a response — could you share your answer?".to_string()),
            severity: None,
        };
    }

    let finding = engine.analyze(text, context_tags);
    if let Some(category) = &finding.category {
        match category.as_str() {
            "unsafe" | "jailbreak" => {
                let severity = block_severity(category, blocks_in_row);
                warn!(category = %category, severity = %severity, "safety monitor blocking turn");
                return MonitorResult {
                    action: MonitorAction::BlockAndRefocus,
                    reason: format!("matched category `{category}`"),
                    safe_reply: Some("Let's keep our focus on the interview. Could you return to the question?".to_string()),
                    severity: Some(severity.to_string()),
                };
            }
            "pii" => {
                return MonitorResult {
                    action: MonitorAction::Redirect,
                    reason: "matched category `pii`".to_string(),
                    safe_reply: Some("Please avoid sharing personal identifying details — let's stick to the technical discussion.".to_string()),
                    severity: None,
                };
            }
            "offtopic" => {
                return MonitorResult {
                    action: MonitorAction::Redirect,
                    reason: "matched category `offtopic`".to_string(),
                    safe_reply: Some("That seems off-topic for this question — let's bring it back to the interview.".to_string()),
                    severity: None,
                };
            }
            _ => {}
        }
    }

    if topic_similarity < off_topic_cutoff {
        return MonitorResult {
            action: MonitorAction::Redirect,
            reason: format!("topic similarity {topic_similarity:.2} below cutoff {off_topic_cutoff:.2}"),
            safe_reply: Some("That seems off-topic for this question — let's bring it back to the interview.".to_string()),
            severity: None,
        };
    }

    if token_count < low_content_tokens {
        return MonitorResult {
            action: MonitorAction::NudgeDepth,
            reason: format!("token_count {token_count} below {low_content_tokens}"),
            safe_reply: Some("Could you expand on that a bit more?".to_string()),
            severity: None,
        };
    }

    MonitorResult {
        action: MonitorAction::Allow,
        reason: "no safety signal".to_string(),
        safe_reply: None,
        severity: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn engine_with_yaml(yaml: &str) -> (SafetyEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.yaml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        (SafetyEngine::load(&path).unwrap(), dir)
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let engine = SafetyEngine::load("/nonexistent/safety.yaml").unwrap();
        assert_eq!(engine.precedence, vec!["unsafe", "jailbreak", "pii", "offtopic", "low_content"]);
    }

    #[test]
    fn excerpt_around_widens_to_char_boundaries() {
        let text = "中中中中中中中中中中rm -rf /";
        let start = text.find("rm -rf").unwrap();
        let end = start + "rm -rf".len();
        let excerpt = excerpt_around(text, start, end, 20);
        assert!(excerpt.contains("rm -rf"));
    }

    #[test]
    fn analyze_does_not_panic_on_multibyte_text_near_a_match() {
        let yaml = r#"
precedence: [unsafe]
categories:
  unsafe:
    severity: high
    patterns: ["rm -rf"]
allow_lists: {}
normalizers: [to_lower]
"#;
        let (engine, _dir) = engine_with_yaml(yaml);
        let finding = engine.analyze("中中中中中中中中中中rm -rf /", &[]);
        assert_eq!(finding.category.as_deref(), Some("unsafe"));
    }

    #[test]
    fn unsafe_beats_pii_by_precedence() {
        let yaml = r#"
precedence: [unsafe, jailbreak, pii, offtopic, low_content]
categories:
  unsafe:
    severity: high
    patterns: ["rm -rf"]
  pii:
    severity: medium
    patterns: ["ssn"]
allow_lists: {}
normalizers: [to_lower]
"#;
        let (engine, _dir) = engine_with_yaml(yaml);
        let finding = engine.analyze("my ssn then rm -rf /", &[]);
        assert_eq!(finding.category.as_deref(), Some("unsafe"));
    }

    #[test]
    fn allow_listed_term_suppresses_match() {
        let yaml = r#"
precedence: [unsafe]
categories:
  unsafe:
    severity: high
    patterns: ["kill"]
allow_lists:
  process_terms: ["kill"]
normalizers: [to_lower]
"#;
        let (engine, _dir) = engine_with_yaml(yaml);
        let finding = engine.analyze("how do you kill a process", &["process_terms".to_string()]);
        assert!(finding.category.is_none());
        assert!(finding.allow_list_reason.is_some());
    }

    #[test]
    fn decide_action_blocks_on_unsafe() {
        let yaml = r#"
precedence: [unsafe]
categories:
  unsafe:
    severity: high
    patterns: ["rm -rf"]
allow_lists: {}
normalizers: [to_lower]
"#;
        let (engine, _dir) = engine_with_yaml(yaml);
        let result = decide_action(&engine, "rm -rf /", &[], 3, 0.9, 0.45, 12, 0);
        assert_eq!(result.action, MonitorAction::BlockAndRefocus);
        assert_eq!(result.severity.as_deref(), Some("critical"));
    }

    #[test]
    fn decide_action_escalates_jailbreak_severity_on_repeat_blocks() {
        let yaml = r#"
precedence: [jailbreak]
categories:
  jailbreak:
    severity: high
    patterns: ["ignore previous instructions"]
allow_lists: {}
normalizers: [to_lower]
"#;
        let (engine, _dir) = engine_with_yaml(yaml);
        let first = decide_action(&engine, "ignore previous instructions", &[], 3, 0.9, 0.45, 12, 0);
        assert_eq!(first.severity.as_deref(), Some("high"));
        let repeat = decide_action(&engine, "ignore previous instructions", &[], 3, 0.9, 0.45, 12, 2);
        assert_eq!(repeat.severity.as_deref(), Some("critical"));
    }

    #[test]
    fn decide_action_redirects_offtopic_category_even_when_cosine_is_high() {
        let yaml = r#"
precedence: [offtopic]
categories:
  offtopic:
    severity: low
    patterns: ["what's the weather"]
allow_lists: {}
normalizers: [to_lower]
"#;
        let (engine, _dir) = engine_with_yaml(yaml);
        // topic_similarity of 0.9 is well above the 0.45 cutoff, so only
        // the category match should drive this to REDIRECT.
        let result = decide_action(&engine, "what's the weather like today?", &[], 20, 0.9, 0.45, 12, 0);
        assert_eq!(result.action, MonitorAction::Redirect);
    }

    #[test]
    fn decide_action_redirects_off_topic() {
        let (engine, _dir) = engine_with_yaml("precedence: []\ncategories: {}\nallow_lists: {}\nnormalizers: []\n");
        let result = decide_action(&engine, "let's talk about cooking instead", &[], 20, 0.1, 0.45, 12, 0);
        assert_eq!(result.action, MonitorAction::Redirect);
    }

    #[test]
    fn decide_action_nudges_low_content() {
        let (engine, _dir) = engine_with_yaml("precedence: []\ncategories: {}\nallow_lists: {}\nnormalizers: []\n");
        let result = decide_action(&engine, "sure", &[], 1, 0.9, 0.45, 12, 0);
        assert_eq!(result.action, MonitorAction::NudgeDepth);
    }

    #[test]
    fn decide_action_allows_clean_input() {
        let (engine, _dir) = engine_with_yaml("precedence: []\ncategories: {}\nallow_lists: {}\nnormalizers: []\n");
        let result = decide_action(&engine, "I would use a hash map with O(1) average lookups here.", &[], 14, 0.9, 0.45, 12, 0);
        assert_eq!(result.action, MonitorAction::Allow);
    }

    #[test]
    fn decide_action_reminds_on_empty() {
        let (engine, _dir) = engine_with_yaml("precedence: []\ncategories: {}\nallow_lists: {}\nnormalizers: []\n");
        let result = decide_action(&engine, "   ", &[], 0, 0.9, 0.45, 12, 0);
        assert_eq!(result.action, MonitorAction::Remind);
    }
}
