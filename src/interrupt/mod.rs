//! Interrupt Recovery (C9) — resumes a session when its think-timer has
//! expired, re-rendering the outstanding question and clearing the timer.
//!
//! Grounded on `original_source/services/think_expiry.py::maybe_resume_think`
//! (the "only act once `now >= think_until`, then clear it" check) and
//! `original_source/agents/interrupt_recovery.py::run_resume` (the
//! reason-to-resume-line table, persona-rendered question, state patch
//! shape). `"reconnected"` and `"pause_resume"` reasons are carried over
//! from the original even though this engine's public surface only
//! triggers `"think_expired"` automatically; the others remain available
//! for a caller-driven resume (spec §4.9).

use chrono::{DateTime, Utc};

use crate::persona::{self, Purpose};
use crate::session::{Question, QuestionMetadata, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    ThinkExpired,
    PauseResume,
    Reconnected,
}

impl ResumeReason {
    fn core_copy(&self) -> &'static str {
        match self {
            ResumeReason::ThinkExpired => "Time's up, ready to share your thoughts?",
            ResumeReason::PauseResume => "Welcome back, shall we continue?",
            ResumeReason::Reconnected => "We're reconnected. Let's pick up where we left off.",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResumePayload {
    pub resume_line: String,
    pub question_text: String,
    pub metadata: Option<QuestionMetadata>,
    /// `true` when `think_until` should be cleared on the session.
    pub clear_think_timer: bool,
}

/// Check whether `session.think_until` has elapsed as of `now`; if so,
/// build a resume payload and report that the timer should be cleared.
/// Returns `None` when there is no pending timer or it hasn't expired
/// yet — callers must not act on a `None`.
pub fn maybe_resume_think(session: &Session, now: DateTime<Utc>) -> Option<ResumePayload> {
    let think_until = session.think_until?;
    if now < think_until {
        return None;
    }
    Some(resume(session, ResumeReason::ThinkExpired))
}

/// Build a resume payload unconditionally for the given reason — used by
/// `maybe_resume_think` and available directly for pause/reconnect flows
/// a transport layer may drive explicitly.
pub fn resume(session: &Session, reason: ResumeReason) -> ResumePayload {
    let resume_line = persona::apply_persona(reason.core_copy(), &session.persona, Purpose::Resume, 2);

    let fallback = "Let's revisit the previous question briefly.".to_string();
    let question_text = session.question_text.clone().unwrap_or(fallback);
    let rendered = persona::apply_persona(&question_text, &session.persona, Purpose::AskQuestion, 2);

    ResumePayload {
        resume_line,
        question_text: rendered,
        metadata: session.question_metadata.clone(),
        clear_think_timer: reason == ResumeReason::ThinkExpired,
    }
}

/// Convenience for rebuilding a `Question` from a resume payload, when
/// the caller needs the same `Question` shape the turn controller emits
/// on a normal ASK decision.
pub fn resume_question(payload: &ResumePayload) -> Option<Question> {
    payload.metadata.clone().map(|metadata| Question { text: payload.question_text.clone(), metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session_with_timer(think_until: Option<DateTime<Utc>>) -> Session {
        let mut session = Session::new("s1", "i1", "c1", None);
        session.think_until = think_until;
        session.question_text = Some("Describe a recent debugging session.".to_string());
        session
    }

    #[test]
    fn no_timer_returns_none() {
        let session = session_with_timer(None);
        assert!(maybe_resume_think(&session, Utc::now()).is_none());
    }

    #[test]
    fn unexpired_timer_returns_none() {
        let session = session_with_timer(Some(Utc::now() + Duration::seconds(30)));
        assert!(maybe_resume_think(&session, Utc::now()).is_none());
    }

    #[test]
    fn expired_timer_triggers_resume_and_clears() {
        let session = session_with_timer(Some(Utc::now() - Duration::seconds(1)));
        let payload = maybe_resume_think(&session, Utc::now()).unwrap();
        assert!(payload.clear_think_timer);
        assert!(payload.question_text.contains("debugging"));
    }

    #[test]
    fn pause_resume_reason_does_not_clear_timer() {
        let session = session_with_timer(None);
        let payload = resume(&session, ResumeReason::PauseResume);
        assert!(!payload.clear_think_timer);
    }
}
