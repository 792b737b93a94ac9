//! Pipeline coordination: cross-stage message types, runtime events, and
//! the agent orchestrator.

pub mod messages;
pub mod orchestrator;

use crate::conversation::{AgentPhase, ConversationTurn};
use crate::models::{ModelRole, ModelState};

/// Runtime events broadcast for UI and observability.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The orchestrator phase changed.
    Phase(AgentPhase),
    /// A turn was appended to the conversation.
    Turn(ConversationTurn),
    /// A clause was submitted for synthesis (sentence-chunked assistant
    /// stream, for live captioning).
    AssistantClause(String),
    /// A model slot changed lifecycle state.
    ModelState { role: ModelRole, state: ModelState },
    /// The user interrupted the agent mid-utterance.
    BargeIn,
}
