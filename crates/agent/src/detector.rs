//! Loop/termination detection.
//!
//! Every executed tool call contributes a fingerprint derived from the
//! tool name, the canonicalized arguments, and the canonicalized result.
//! The detector inspects the running record and decides whether the loop
//! may continue, needs a corrective nudge, or must stop. The decision is
//! a pure function of the record — same record, same verdict — which keeps
//! it independently unit-testable.

use deskclaw_config::ToolLoopConfig;
use deskclaw_core::{ToolCall, ToolOutcome};
use sha2::{Digest, Sha256};

/// One recorded call: tool name plus the combined fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Tool name (kept readable for logs and nudge messages)
    pub tool: String,

    /// SHA-256 over name + canonical arguments + result
    pub fingerprint: String,
}

impl CallRecord {
    /// Fingerprint an executed call.
    ///
    /// serde_json maps are ordered by key, so serializing the arguments
    /// value is already canonical.
    pub fn of(call: &ToolCall, outcome: &ToolOutcome) -> Self {
        let args = serde_json::to_string(&call.arguments).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(call.name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(args.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(outcome.output.as_bytes());
        Self {
            tool: call.name.clone(),
            fingerprint: format!("{:x}", hasher.finalize()),
        }
    }
}

/// Append-only history of executed calls for one loop instance.
///
/// Invariant: the record never grows beyond the configured hard cap; the
/// engine terminates the loop when the cap is reached.
#[derive(Debug, Clone)]
pub struct LoopRecord {
    entries: Vec<CallRecord>,
    cap: usize,
}

impl LoopRecord {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap,
        }
    }

    /// Append an entry. Returns false (and drops the entry) once the cap
    /// is reached — the loop must already be terminating at that point.
    pub fn push(&mut self, entry: CallRecord) -> bool {
        if self.entries.len() >= self.cap {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn at_cap(&self) -> bool {
        self.entries.len() >= self.cap
    }

    /// Length of the run of identical fingerprints at the tail.
    pub fn tail_run_length(&self) -> u32 {
        let Some(last) = self.entries.last() else {
            return 0;
        };
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.fingerprint == last.fingerprint)
            .count() as u32
    }

    /// Tool name of the most recent entry.
    pub fn last_tool(&self) -> Option<&str> {
        self.entries.last().map(|e| e.tool.as_str())
    }
}

/// Severity attached to a detector verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Corrective nudge; the loop continues.
    Warning,
    /// Forced termination.
    Critical,
}

/// The detector's decision for the current state of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the loop may request another model turn.
    pub should_continue: bool,

    /// Corrective message to attach to the next continuation, if any.
    pub nudge: Option<String>,

    /// Severity classification when a nudge or stop applies.
    pub severity: Option<Severity>,
}

impl Verdict {
    fn proceed() -> Self {
        Self {
            should_continue: true,
            nudge: None,
            severity: None,
        }
    }
}

/// Decides, per executed call, whether one loop keeps running.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: ToolLoopConfig,
}

impl LoopDetector {
    pub fn new(config: ToolLoopConfig) -> Self {
        Self { config }
    }

    /// Inspect the record and produce a verdict.
    ///
    /// Policy tiers:
    /// - identical fingerprints repeated to the tolerance: stop, whatever
    ///   the iteration count
    /// - at or above the critical threshold: stop
    /// - in the warning band: continue, nudging once per repeated run
    /// - below the warning threshold: continue silently
    pub fn check(&self, record: &LoopRecord) -> Verdict {
        let iterations = record.len() as u32;
        let run = record.tail_run_length();
        let tool = record.last_tool().unwrap_or("?");

        if run >= self.config.repeat_tolerance {
            return Verdict {
                should_continue: false,
                nudge: Some(format!(
                    "The `{tool}` call was repeated {run} times with identical arguments and results. \
                     Stop calling tools and give the user your answer based on what you already have."
                )),
                severity: Some(Severity::Critical),
            };
        }

        if iterations >= self.config.critical_threshold {
            return Verdict {
                should_continue: false,
                nudge: Some(format!(
                    "This task has used {iterations} tool calls without concluding. \
                     Stop calling tools and give the user your answer based on what you already have."
                )),
                severity: Some(Severity::Critical),
            };
        }

        if iterations >= self.config.warn_threshold && run == 2 {
            // exactly the second consecutive occurrence: nudge once per run
            return Verdict {
                should_continue: true,
                nudge: Some(format!(
                    "You just repeated the `{tool}` call with the same arguments and got the same \
                     result. Change strategy, or conclude with an answer."
                )),
                severity: Some(Severity::Warning),
            };
        }

        Verdict::proceed()
    }
}
