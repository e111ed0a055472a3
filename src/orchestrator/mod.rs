//! Execution orchestrator.
//!
//! - [`context`]: the observable execution state
//! - [`machine`]: the phase transition table
//! - [`prompts`]: per-phase prompt construction
//! - [`runner`]: agent turns through the Claude CLI
//! - [`journal`]: on-disk record of phase transitions
//! - [`engine`]: the step loop and its control handle

pub mod context;
pub mod engine;
pub mod journal;
pub mod machine;
pub mod prompts;
pub mod runner;

pub use context::{
    Blocker, ConfirmationStep, ExecutionContext, ExecutionError, LogEntry, LogKind,
    PendingConfirmation, PendingQuestion, QaPair,
};
pub use engine::{Collaborators, Orchestrator, WorkflowHandle, WorkflowSettings, workflow};
pub use journal::{JournalEntry, PhaseJournal};
pub use runner::{AgentRequest, AgentRunner, AgentSettings, AgentTurn, ClaudeRunner};
