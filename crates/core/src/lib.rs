//! # Deskclaw Core
//!
//! Domain types, collaborator traits, and error definitions for the deskclaw
//! orchestration runtime. This crate has **zero framework dependencies** — it
//! defines the domain model that the engine crates implement against.
//!
//! ## Design Philosophy
//!
//! The orchestration core is a library, not a service: the language model,
//! the tool handlers, and the desktop automation primitives are external
//! collaborators defined here as traits. The engine crates (`deskclaw-agent`,
//! `deskclaw-subagents`, `deskclaw-takecontrol`) consume these abstractions
//! and never know which concrete backend is wired in. This enables:
//! - Swapping implementations via configuration
//! - Deterministic testing with scripted mock collaborators
//! - Clean dependency graph (all crates depend inward on core)

pub mod automation;
pub mod error;
pub mod message;
pub mod model;
pub mod observer;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use automation::{
    Capture, ControlAction, ControlActionKind, ControlStep, DesktopAutomation, PointerButton,
};
pub use error::{AutomationError, Error, ModelError, Result, SessionError, SpawnError, ToolError};
pub use message::{Conversation, ConversationId, ImageBlock, Message, MessageToolCall, Role};
pub use model::{ModelClient, ModelTurn, ToolDefinition};
pub use observer::{LoopObserver, LoopStatus, NoopObserver};
pub use tool::{Tool, ToolCall, ToolExecutor, ToolOutcome, ToolRegistry};
