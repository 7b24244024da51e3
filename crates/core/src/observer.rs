//! Loop observer — per-call progress reporting.
//!
//! Observers are injected through the options struct of each long-running
//! entry point, one observer per loop instance. Concurrent sub-agents
//! therefore never cross-talk through a shared callback slot. Every method
//! has a default no-op body so implementers override only what they need.

use crate::tool::ToolOutcome;

/// Coarse lifecycle states reported via [`LoopObserver::on_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// The loop started processing.
    Started,
    /// Waiting on a model round-trip.
    Thinking,
    /// Executing tool calls or desktop actions.
    Acting,
    /// The loop reached a terminal state.
    Finished,
}

/// Observer interface for loop progress, one method per event kind.
pub trait LoopObserver: Send + Sync {
    /// The loop's coarse status changed.
    fn on_status(&self, _status: LoopStatus) {}

    /// The model produced narration or answer text.
    fn on_text(&self, _text: &str) {}

    /// A tool execution is starting.
    fn on_tool_started(&self, _name: &str, _arguments: &serde_json::Value) {}

    /// A tool execution finished.
    fn on_tool_finished(&self, _name: &str, _outcome: &ToolOutcome) {}

    /// A desktop action was executed (take-control sessions).
    fn on_action(&self, _description: &str) {}
}

/// An observer that ignores everything.
pub struct NoopObserver;

impl LoopObserver for NoopObserver {}
