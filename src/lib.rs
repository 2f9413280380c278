//! Stateful multi-turn interview orchestration engine.
//!
//! The crate is organized as one module per pipeline component (spec
//! §2's numbered components C1-C10), composed by [`engine::Engine`],
//! the Turn Controller. See `DESIGN.md` for the grounding ledger mapping
//! each module back to the teacher repo it was adapted from.

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod flow;
pub mod hint;
pub mod interrupt;
pub mod intent;
pub mod llm;
pub mod observability;
pub mod persona;
pub mod question;
pub mod safety;
pub mod scoring;
pub mod session;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{Engine, TurnInput};
pub use error::{EngineError, EngineResult};
pub use session::{Decision, DecisionTag, Rubric, Session};
