mod constants;
mod context;
mod errors;
mod gate;
mod generator;
mod types;

pub use constants::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_CONTEXT_MESSAGES, DEFAULT_FALLBACK_REPLY};
pub use context::{build_context, build_prompt};
pub use errors::ReplyError;
pub use gate::{ConfidenceGate, GateVerdict};
pub use generator::{
    generate_or_fallback, GeneratorConfig, HttpReplyGenerator, ReplyGenerator, TimedGenerator,
};
pub use types::{ContextTurn, GeneratedReply, ReplyRequest, TurnRole};
