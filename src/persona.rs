//! Persona styling hook (spec §11 supplement, dropped by the distillation
//! but present in the original implementation) — wraps a core message in
//! persona-appropriate phrasing before it reaches the candidate.
//!
//! Ported from `original_source/agents/persona_manager.py::apply_persona`:
//! the two fixed template tables (`Friendly Expert` vs `Firm Evaluator`,
//! the latter just the former with its softening phrases stripped) and
//! the sentence-trimming budget. The LLM "polish" pass is optional and
//! goes through the same `OracleAdapter` chat variant the rest of the
//! engine uses rather than a bespoke prompt-file loader.

use crate::llm::{ChatMessage, OracleAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    AskQuestion,
    Redirect,
    NudgeDepth,
    Remind,
    BlockRefocus,
    Hint,
    Resume,
    Clarify,
    Wrapup,
}

fn template_for(persona: &str, purpose: Purpose) -> &'static str {
    let friendly = matches!(persona, "Friendly Expert");
    match purpose {
        Purpose::AskQuestion => "{core}",
        Purpose::Redirect => {
            if friendly {
                "Interesting! Let's refocus on this topic: {core}"
            } else {
                "Let's refocus on this topic: {core}"
            }
        }
        Purpose::NudgeDepth => "That's a start, could you add your role, a key decision, and the outcome?",
        Purpose::Remind => {
            if friendly {
                "Take your time, would you like a hint or 30s to think?"
            } else {
                "Let's proceed, would you like a hint or 30s to think?"
            }
        }
        Purpose::BlockRefocus => "I can't follow instructions that change or bypass the interview rules. Let's continue: {core}",
        Purpose::Hint => "Here's a nudge: {core}",
        Purpose::Resume => "Let's pick up where we left off. {core}",
        Purpose::Clarify => "Quick clarification: {core}",
        Purpose::Wrapup => "Before we close: {core}",
    }
}

/// Keep at most `max_sentences` sentences, splitting on `.`/`!`/`?`
/// followed by whitespace.
fn trim_sentences(text: &str, max_sentences: usize) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let next_is_space = bytes.get(i + 1).map(|b| (*b as char).is_whitespace()).unwrap_or(true);
            if next_is_space {
                sentences.push(text[start..=i].trim().to_string());
                start = i + 1;
                if sentences.len() >= max_sentences {
                    break;
                }
            }
        }
    }
    if sentences.is_empty() {
        return text.to_string();
    }
    sentences.join(" ")
}

/// Apply persona-aware phrasing to `text` for the given `purpose`,
/// without an LLM polish pass.
pub fn apply_persona(text: &str, persona: &str, purpose: Purpose, max_sentences: usize) -> String {
    let template = template_for(persona, purpose);
    let has_core = template.contains("{core}");
    let core_budget = if has_core && purpose != Purpose::AskQuestion {
        max_sentences.saturating_sub(1).max(1)
    } else {
        max_sentences
    };
    let core = trim_sentences(text, core_budget.max(1));
    let formatted = if has_core {
        template.replace("{core}", &core).trim().to_string()
    } else {
        template.trim().to_string()
    };
    trim_sentences(&formatted, max_sentences)
}

/// Optional LLM polish of an already-templated message, using the chat
/// (schema-free) oracle variant. Falls back to the input unchanged on
/// any transport failure, matching the original's best-effort behavior.
pub async fn polish(adapter: &OracleAdapter, oracle_name: &str, text: &str, persona: &str) -> String {
    let messages = vec![
        ChatMessage::system(format!(
            "Rewrite the following interviewer line in the voice of a {persona} persona. Keep the meaning. Reply with only the rewritten line."
        )),
        ChatMessage::user(text.to_string()),
    ];
    match adapter.chat(oracle_name, messages).await {
        Ok(polished) if !polished.trim().is_empty() => polished.trim().to_string(),
        _ => text.to_string(),
    }
}
