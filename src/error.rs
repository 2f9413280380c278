//! Error taxonomy for the interview orchestration engine.
//!
//! Terminal kinds (`SessionNotFound`, `SessionExpired`, `LLMTransportError`,
//! `ConfigError`, `StateCorruption`, `ValidationError`) propagate to the
//! caller. `LLMSchemaError` is recovered locally by the component that
//! triggered it (monitor/intent/evaluator) and never escapes the turn
//! pipeline; it is still a first-class variant so fallback paths can log it
//! with `tracing::warn!` before recovering.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("llm transport failure calling oracle `{oracle}`: {source}")]
    LLMTransportError {
        oracle: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("llm `{oracle}` produced no schema-valid output after {attempts} attempt(s): {last_error}")]
    LLMSchemaError {
        oracle: String,
        attempts: u32,
        last_error: String,
    },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("checkpoint state corrupted for session `{0}`")]
    StateCorruption(String),

    #[error("invalid request: {0}")]
    ValidationError(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
