//! Error types for the deskclaw domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the error taxonomy mirrors
//! the recovery policy: tool failures are converted to data and fed back to
//! the model, model-call failures terminate a loop with a classification,
//! capacity and protocol violations are rejected at the call boundary, and
//! cancellation is never an error at all.

use thiserror::Error;

/// The top-level error type for all deskclaw operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model client errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Desktop automation errors ---
    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    // --- Sub-agent pool errors ---
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    // --- Take-control session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures raised by the model-client collaborator.
///
/// These are never retried by the orchestration core; retry policy, if any,
/// belongs to the client implementation.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by model provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model client does not support computer-use decisions")]
    ComputerUseUnsupported,

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
}

/// Failures raised by the tool-execution collaborator.
///
/// A conforming executor reports "tool not found" and ordinary execution
/// failures as unsuccessful [`ToolOutcome`](crate::tool::ToolOutcome)s, not
/// as errors; these variants cover catastrophic host failures, which the
/// loop engine converts back into failure outcomes at the call site.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Host error during tool execution: {0}")]
    Host(String),
}

/// Failures raised by the desktop-automation collaborator.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Screen capture failed: {0}")]
    Capture(String),

    #[error("Input injection failed: {action} — {reason}")]
    Input { action: String, reason: String },
}

/// Rejections from the sub-agent pool, raised synchronously by `spawn`
/// before any state mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("Sub-agent capacity exceeded: {active} of {max} slots in use")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Sub-agent task must not be empty")]
    EmptyTask,
}

/// Terminal failures of a take-control session.
///
/// Every variant that can occur mid-session carries the accumulated action
/// log — a session never ends with an unexplained empty result.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Take-control session requires explicit user confirmation")]
    NotConfirmed,

    #[error("Vision protocol failure after {retries} unparseable turns")]
    ProtocolFailure { retries: u32, log: String },

    #[error("Model call failed during session: {source}")]
    Model {
        source: ModelError,
        log: String,
    },

    #[error("Automation failed during session: {source}")]
    Automation {
        source: AutomationError,
        log: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_displays_correctly() {
        let err = Error::Model(ModelError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn spawn_error_reports_capacity() {
        let err = SpawnError::CapacityExceeded { active: 3, max: 3 };
        assert!(err.to_string().contains("3 of 3"));
    }

    #[test]
    fn session_error_keeps_log() {
        let err = SessionError::ProtocolFailure {
            retries: 3,
            log: "→ clicked OK".into(),
        };
        assert!(err.to_string().contains("3 unparseable"));
        match err {
            SessionError::ProtocolFailure { log, .. } => assert!(!log.is_empty()),
            _ => panic!("wrong variant"),
        }
    }
}
