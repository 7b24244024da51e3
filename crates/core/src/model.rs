//! ModelClient trait — the abstraction over the language-model collaborator.
//!
//! The orchestration core never formats provider wire messages; it hands a
//! conversation to the client and receives either plain text (legacy
//! sequential protocol) or a structured turn of text plus tool calls
//! (batched protocol). Take-control sessions additionally ask the client
//! for desktop action decisions when it advertises the capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::automation::ControlStep;
use crate::error::ModelError;
use crate::message::Conversation;
use crate::tool::ToolCall;

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// One structured model turn: narration text plus zero or more tool calls.
///
/// An empty `calls` vector means the text is the model's final answer.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    /// Narration / answer text for this turn
    pub text: String,

    /// Tool calls requested in this turn, already parsed by the client
    pub calls: Vec<ToolCall>,
}

/// The model-client collaborator contract.
///
/// All methods are asynchronous and may fail; failures propagate to the
/// calling loop as a terminal-with-error condition, never silently
/// swallowed. The computer-use methods have default implementations so
/// that text-only clients remain valid — the take-control engine probes
/// `supports_computer_use` to pick its protocol.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// A human-readable name for this client (for logs).
    fn name(&self) -> &str;

    /// Ask for a plain-text continuation of the conversation.
    ///
    /// Used by the sequential protocol, where tool requests arrive as
    /// embedded text blocks, and by the vision-fallback take-control
    /// protocol.
    async fn ask(&self, conversation: &Conversation) -> Result<String, ModelError>;

    /// Ask for a structured turn, advertising the given tools.
    ///
    /// Tool results from the previous turn travel inside `conversation`
    /// as tool messages correlated by call id, so this method also serves
    /// as the "continue with tool results" operation.
    async fn ask_with_tools(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, ModelError>;

    /// Whether this client can drive the structured computer-use protocol.
    fn supports_computer_use(&self) -> bool {
        false
    }

    /// Decide the next desktop control steps from the conversation and the
    /// latest capture dimensions.
    ///
    /// Default implementation reports the capability as unsupported, which
    /// routes take-control sessions to the vision-fallback protocol.
    async fn decide_action(
        &self,
        _system_prompt: &str,
        _conversation: &Conversation,
        _capture_size: (u32, u32),
    ) -> Result<Vec<ControlStep>, ModelError> {
        Err(ModelError::ComputerUseUnsupported)
    }
}
