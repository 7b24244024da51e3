//! The tool-calling loop engine — the heart of deskclaw.
//!
//! One loop instance drives one conversation through the
//! **propose → execute → observe → decide** cycle:
//!
//! 1. Ask the model for its next step
//! 2. Parse or receive the requested tool call(s)
//! 3. Execute via the external tool-execution collaborator
//! 4. Sanitize the outcome and feed it back as data
//! 5. Consult the loop detector, then repeat or stop
//!
//! Two protocol flavors share one control policy: the *sequential* flavor
//! (legacy embedded text blocks, one call per turn) and the *batched*
//! flavor (structured multi-call turns correlated by call id). The loop
//! continues until the model answers without a call, the detector forces
//! termination, cancellation is requested, or the hard iteration cap hits.

pub mod detector;
pub mod loop_runner;
pub mod parser;
pub mod sanitize;

pub use detector::{CallRecord, LoopDetector, LoopRecord, Severity, Verdict};
pub use loop_runner::{LoopOptions, LoopOutcome, SteeringQueue, StopReason, ToolLoop};
pub use parser::{parse_tool_call, validate_calls};
pub use sanitize::sanitize_output;

#[cfg(test)]
pub(crate) mod test_helpers;
