// Viva - External agent collaborator seam
//
// The periodic update path hands the agent a snapshot of the conversation
// and merges whatever comes back. The agent is never on the audio path.

use async_trait::async_trait;

/// Snapshot handed to the agent on each periodic update.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    /// Rendered transcript, one "speaker: text" line per utterance.
    pub transcript: String,
    /// Accumulated interviewer notes from earlier updates.
    pub notes: String,
    /// Interview plan, when one exists.
    pub plan: Option<String>,
    pub elapsed_secs: u64,
    pub target_secs: u64,
}

/// What the agent hands back. Every field is advisory; `None` means
/// "keep what you have".
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub notes: String,
    pub next_question: Option<String>,
    pub phase: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("agent call failed: {0}")]
pub struct AgentError(pub String);

/// Collaborator that refines interviewer guidance from the live transcript.
#[async_trait]
pub trait InterviewAgent: Send + Sync {
    async fn refine(&self, context: AgentContext) -> Result<AgentUpdate, AgentError>;
}
