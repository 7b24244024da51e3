//! The tool-calling loop engine.
//!
//! Two protocol flavors share one control policy:
//!
//! - **sequential**: the model answers in plain text; a single tool request
//!   may be embedded as a legacy JSON block. One call, one result, strictly
//!   ordered.
//! - **batched**: the model answers with text plus zero or more structured
//!   calls per turn; every call executes and reports its outcome
//!   (correlated by id) before the next turn is requested.
//!
//! Termination is governed by the shared [`ControlPolicy`]: the loop
//! detector's verdicts plus the hard iteration cap. Tool failures are
//! converted to failure outcomes and fed back to the model; model-call
//! failures terminate the loop with a classification; cancellation is a
//! normal exit that returns the best partial response collected so far.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deskclaw_config::ToolLoopConfig;
use deskclaw_core::{
    Conversation, LoopObserver, LoopStatus, Message, MessageToolCall, ModelClient, NoopObserver,
    Role, ToolCall, ToolExecutor, ToolOutcome,
};

use crate::detector::{CallRecord, LoopDetector, LoopRecord};
use crate::parser;
use crate::sanitize::sanitize_output;

/// Directive appended to a tool result when the detector has nothing to say.
const CONTINUE_DIRECTIVE: &str = "Use this result to decide your next step: \
call another tool if needed, or reply with your final answer.";

/// Out-of-band instructions delivered into a running loop.
///
/// Instructions are drained into the conversation immediately before the
/// next model round-trip; delivery is best-effort — a loop about to finish
/// may complete without seeing them.
#[derive(Default)]
pub struct SteeringQueue {
    pending: Mutex<Vec<String>>,
}

impl SteeringQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an instruction for the next model round-trip.
    pub fn push(&self, instruction: impl Into<String>) {
        self.pending.lock().unwrap().push(instruction.into());
    }

    /// Take all queued instructions.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

/// Per-run options for a loop instance.
pub struct LoopOptions {
    /// Cooperative cancellation token; checked at loop entry, before each
    /// model call, and immediately after each tool execution.
    pub cancel: CancellationToken,

    /// Progress observer for this run only.
    pub observer: Arc<dyn LoopObserver>,

    /// When set, tools outside this set are not executed; the engine
    /// synthesizes a rejection outcome instead and keeps the loop alive.
    pub allowed_tools: Option<HashSet<String>>,

    /// Out-of-band steering source, if any.
    pub steering: Option<Arc<SteeringQueue>>,

    /// System prompt inserted at the head of the conversation when absent.
    pub system_prompt: Option<String>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            observer: Arc::new(NoopObserver),
            allowed_tools: None,
            steering: None,
            system_prompt: None,
        }
    }
}

/// Why a loop run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without requesting a tool.
    Completed,
    /// The loop detector forced termination.
    DetectorStop,
    /// The hard iteration cap was reached.
    HardCap,
    /// Cancellation was requested.
    Cancelled,
    /// The model client failed; the classification is attached.
    ModelFailed(String),
}

/// The result of one loop run. Every terminal path produces a populated,
/// human-readable response — even failure and cancellation.
#[derive(Debug)]
pub struct LoopOutcome {
    /// Final (or best partial) response text, with a reason note appended
    /// on non-Completed stops.
    pub response: String,

    /// Model round-trips performed.
    pub iterations: u32,

    /// Tool calls executed (including synthesized rejections).
    pub tool_calls_made: usize,

    /// Distinct tool names used, in first-use order.
    pub tools_used: Vec<String>,

    /// Whether cancellation ended the run.
    pub cancelled: bool,

    /// Terminal classification.
    pub stop: StopReason,
}

/// The shared control policy: loop record + detector + hard cap.
///
/// Both protocol flavors report every executed call here and act on the
/// returned step, so detector and cap logic exist exactly once.
struct ControlPolicy {
    detector: LoopDetector,
    record: LoopRecord,
}

enum PolicyStep {
    Continue { nudge: Option<String> },
    Stop { reason: StopReason, note: String },
}

impl ControlPolicy {
    fn new(config: &ToolLoopConfig) -> Self {
        Self {
            detector: LoopDetector::new(config.clone()),
            record: LoopRecord::new(config.hard_cap as usize),
        }
    }

    fn note_call(&mut self, call: &ToolCall, outcome: &ToolOutcome) -> PolicyStep {
        if !self.record.push(CallRecord::of(call, outcome)) {
            // cap already reached on an earlier call in this batch
            return PolicyStep::Stop {
                reason: StopReason::HardCap,
                note: "hard iteration cap reached".into(),
            };
        }

        if self.record.at_cap() {
            return PolicyStep::Stop {
                reason: StopReason::HardCap,
                note: "hard iteration cap reached".into(),
            };
        }

        let verdict = self.detector.check(&self.record);
        if verdict.should_continue {
            PolicyStep::Continue {
                nudge: verdict.nudge,
            }
        } else {
            PolicyStep::Stop {
                reason: StopReason::DetectorStop,
                note: verdict
                    .nudge
                    .unwrap_or_else(|| "repetitive tool use detected".into()),
            }
        }
    }
}

/// One tool-calling loop engine instance.
pub struct ToolLoop {
    client: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    config: ToolLoopConfig,
}

impl ToolLoop {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
        config: ToolLoopConfig,
    ) -> Self {
        Self {
            client,
            tools,
            config,
        }
    }

    /// Run the sequential (legacy text-block) flavor.
    pub async fn run_sequential(
        &self,
        user_message: &str,
        conversation: &mut Conversation,
        options: &LoopOptions,
    ) -> LoopOutcome {
        self.prepare(conversation, user_message, options);
        let observer = options.observer.clone();
        observer.on_status(LoopStatus::Started);

        let mut policy = ControlPolicy::new(&self.config);
        let mut totals = Totals::default();

        info!(conversation_id = %conversation.id, "Sequential tool loop starting");

        loop {
            // checkpoint: loop entry / pre-model-call
            if options.cancel.is_cancelled() {
                return totals.finish_cancelled(&observer);
            }

            drain_steering(options, conversation);

            observer.on_status(LoopStatus::Thinking);
            let text = match self.client.ask(conversation).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "Model call failed, terminating loop");
                    return totals.finish_model_failed(e.to_string(), &observer);
                }
            };
            totals.iterations += 1;
            observer.on_text(&text);

            let Some(call) = parser::parse_tool_call(&text) else {
                // No call found — this is the final answer.
                conversation.push(Message::assistant(&text));
                info!(
                    iterations = totals.iterations,
                    tool_calls = totals.tool_calls_made,
                    "Sequential tool loop completed"
                );
                return totals.finish(text, StopReason::Completed, &observer);
            };

            totals.last_text = text.clone();
            conversation.push(Message::assistant(&text));

            observer.on_status(LoopStatus::Acting);
            let outcome = self.execute_guarded(&call, options).await;
            totals.count_call(&call.name);

            // checkpoint: immediately after tool execution, so an expensive
            // call that lands post-cancellation doesn't buy another
            // model round-trip
            if options.cancel.is_cancelled() {
                return totals.finish_cancelled(&observer);
            }

            let sanitized = sanitize_output(&outcome.output, self.config.max_result_chars);
            match policy.note_call(&call, &outcome) {
                PolicyStep::Continue { nudge } => {
                    let directive = nudge.as_deref().unwrap_or(CONTINUE_DIRECTIVE);
                    conversation.push(Message::user(format!("{sanitized}\n\n{directive}")));
                }
                PolicyStep::Stop { reason, note } => {
                    conversation.push(Message::user(sanitized));
                    return totals.finish_stopped(reason, &note, &observer);
                }
            }
        }
    }

    /// Run the batched (structured multi-call) flavor.
    pub async fn run_batched(
        &self,
        user_message: &str,
        conversation: &mut Conversation,
        options: &LoopOptions,
    ) -> LoopOutcome {
        self.prepare(conversation, user_message, options);
        let observer = options.observer.clone();
        observer.on_status(LoopStatus::Started);

        let tool_defs = match &options.allowed_tools {
            Some(allowed) => self
                .tools
                .definitions()
                .into_iter()
                .filter(|d| allowed.contains(&d.name))
                .collect(),
            None => self.tools.definitions(),
        };

        let mut policy = ControlPolicy::new(&self.config);
        let mut totals = Totals::default();

        info!(conversation_id = %conversation.id, tools = tool_defs.len(), "Batched tool loop starting");

        loop {
            // checkpoint: loop entry / pre-model-call
            if options.cancel.is_cancelled() {
                return totals.finish_cancelled(&observer);
            }

            drain_steering(options, conversation);

            observer.on_status(LoopStatus::Thinking);
            let turn = match self.client.ask_with_tools(conversation, &tool_defs).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "Model call failed, terminating loop");
                    return totals.finish_model_failed(e.to_string(), &observer);
                }
            };
            totals.iterations += 1;
            if !turn.text.is_empty() {
                observer.on_text(&turn.text);
                totals.last_text = turn.text.clone();
            }

            let calls = parser::validate_calls(turn.calls);

            let mut assistant = Message::assistant(&turn.text);
            assistant.tool_calls = calls
                .iter()
                .map(|c| MessageToolCall {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: c.arguments.to_string(),
                })
                .collect();
            conversation.push(assistant);

            if calls.is_empty() {
                info!(
                    iterations = totals.iterations,
                    tool_calls = totals.tool_calls_made,
                    "Batched tool loop completed"
                );
                return totals.finish(turn.text, StopReason::Completed, &observer);
            }

            observer.on_status(LoopStatus::Acting);
            debug!(batch = calls.len(), "Executing tool call batch");

            let mut stop: Option<(StopReason, String)> = None;
            let mut nudge_next: Option<String> = None;

            for call in &calls {
                // A stop verdict earlier in this batch does not skip the
                // siblings: they still execute and report their outcomes so
                // the model's world-view stays consistent. Only further
                // turns are suppressed.
                let outcome = self.execute_guarded(call, options).await;
                totals.count_call(&call.name);

                let sanitized = sanitize_output(&outcome.output, self.config.max_result_chars);
                conversation.push(Message::tool_result(&call.id, &sanitized));

                // checkpoint: immediately after tool execution. Cancellation
                // abandons the rest of the batch — no model turn will
                // consume the remaining results anyway.
                if options.cancel.is_cancelled() {
                    return totals.finish_cancelled(&observer);
                }

                match policy.note_call(call, &outcome) {
                    PolicyStep::Continue { nudge } => {
                        if stop.is_none() && nudge_next.is_none() {
                            nudge_next = nudge;
                        }
                    }
                    PolicyStep::Stop { reason, note } => {
                        if stop.is_none() {
                            stop = Some((reason, note));
                        }
                    }
                }
            }

            if let Some((reason, note)) = stop {
                return totals.finish_stopped(reason, &note, &observer);
            }

            if let Some(nudge) = nudge_next {
                conversation.push(Message::user(nudge));
            }
        }
    }

    /// Insert the system prompt (when missing) and the user message.
    fn prepare(&self, conversation: &mut Conversation, user_message: &str, options: &LoopOptions) {
        if let Some(prompt) = &options.system_prompt
            && conversation.messages.first().map(|m| m.role) != Some(Role::System)
        {
            conversation.messages.insert(0, Message::system(prompt));
        }
        conversation.push(Message::user(user_message));
    }

    /// Execute one call through the collaborator, converting permission
    /// rejections and host errors into failure outcomes.
    async fn execute_guarded(&self, call: &ToolCall, options: &LoopOptions) -> ToolOutcome {
        if let Some(allowed) = &options.allowed_tools
            && !allowed.contains(&call.name)
        {
            debug!(tool = %call.name, "Rejecting disallowed tool");
            return ToolOutcome::fail(format!(
                "tool not permitted for this sub-agent: {}",
                call.name
            ));
        }

        options.observer.on_tool_started(&call.name, &call.arguments);
        let started = Instant::now();

        let outcome = match self.tools.execute(&call.name, call.arguments.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution raised");
                ToolOutcome::fail(e.to_string())
            }
        };

        debug!(
            tool = %call.name,
            success = outcome.success,
            duration_ms = started.elapsed().as_millis() as u64,
            "Tool executed"
        );
        options.observer.on_tool_finished(&call.name, &outcome);
        outcome
    }
}

/// Push queued steering instructions into the conversation.
fn drain_steering(options: &LoopOptions, conversation: &mut Conversation) {
    if let Some(queue) = &options.steering {
        for instruction in queue.drain() {
            debug!("Applying steering instruction");
            conversation.push(Message::user(instruction));
        }
    }
}

/// Running totals plus terminal-outcome constructors.
#[derive(Default)]
struct Totals {
    iterations: u32,
    tool_calls_made: usize,
    tools_used: Vec<String>,
    last_text: String,
}

impl Totals {
    fn count_call(&mut self, name: &str) {
        self.tool_calls_made += 1;
        if !self.tools_used.iter().any(|t| t == name) {
            self.tools_used.push(name.to_string());
        }
    }

    fn finish(
        self,
        response: String,
        stop: StopReason,
        observer: &Arc<dyn LoopObserver>,
    ) -> LoopOutcome {
        observer.on_status(LoopStatus::Finished);
        LoopOutcome {
            response,
            iterations: self.iterations,
            tool_calls_made: self.tool_calls_made,
            tools_used: self.tools_used,
            cancelled: matches!(stop, StopReason::Cancelled),
            stop,
        }
    }

    fn finish_stopped(
        self,
        reason: StopReason,
        note: &str,
        observer: &Arc<dyn LoopObserver>,
    ) -> LoopOutcome {
        info!(
            iterations = self.iterations,
            tool_calls = self.tool_calls_made,
            note,
            "Tool loop stopped"
        );
        let response = with_reason(&self.last_text, &format!("[loop stopped: {note}]"));
        self.finish(response, reason, observer)
    }

    fn finish_cancelled(self, observer: &Arc<dyn LoopObserver>) -> LoopOutcome {
        info!(
            iterations = self.iterations,
            tool_calls = self.tool_calls_made,
            "Tool loop cancelled"
        );
        let response = with_reason(&self.last_text, "[cancelled at user request]");
        self.finish(response, StopReason::Cancelled, observer)
    }

    fn finish_model_failed(
        self,
        classification: String,
        observer: &Arc<dyn LoopObserver>,
    ) -> LoopOutcome {
        let response = with_reason(&self.last_text, &format!("[model call failed: {classification}]"));
        self.finish(response, StopReason::ModelFailed(classification), observer)
    }
}

fn with_reason(base: &str, reason: &str) -> String {
    if base.is_empty() {
        reason.to_string()
    } else {
        format!("{base}\n\n{reason}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use deskclaw_core::ModelTurn;

    fn config() -> ToolLoopConfig {
        ToolLoopConfig::default()
    }

    fn engine(client: MockClient, tools: RecordingExecutor) -> ToolLoop {
        ToolLoop::new(Arc::new(client), Arc::new(tools), config())
    }

    fn tool_block(command: &str) -> String {
        format!(
            "Running a command.\n```json\n{{\"tool\": \"shell\", \"args\": {{\"command\": \"{command}\"}}}}\n```"
        )
    }

    // ── Sequential flavor ──

    #[tokio::test]
    async fn sequential_text_only_completes() {
        let client = MockClient::sequential(vec!["The answer is 42."]);
        let engine = engine(client, RecordingExecutor::ok("done"));

        let mut conv = Conversation::new();
        let outcome = engine
            .run_sequential("What is the answer?", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.response, "The answer is 42.");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.tool_calls_made, 0);
        assert_eq!(outcome.stop, StopReason::Completed);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn sequential_tool_then_answer() {
        let client = MockClient::sequential(vec![tool_block("ls"), "Two files found.".to_string()]);
        let tools = RecordingExecutor::ok("a.txt b.txt");
        let calls = tools.calls.clone();
        let engine = engine(client, tools);

        let mut conv = Conversation::new();
        let outcome = engine
            .run_sequential("List files", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.response, "Two files found.");
        // model calls = 1 + executed tool calls
        assert_eq!(outcome.iterations, 1 + outcome.tool_calls_made as u32);
        assert_eq!(outcome.tools_used, vec!["shell".to_string()]);
        assert_eq!(calls.lock().unwrap().len(), 1);

        // the sanitized result went back as data, not instructions
        let fed_back = conv
            .messages
            .iter()
            .find(|m| m.content.contains("a.txt"))
            .unwrap();
        assert!(fed_back.content.contains(crate::sanitize::RESULT_OPEN));
    }

    #[tokio::test]
    async fn sequential_repetition_stops_at_tolerance_not_cap() {
        // The model never concludes: same call, same arguments, forever.
        let block = tool_block("ls");
        let client = MockClient::sequential(vec![&block; 10]);
        let engine = engine(client, RecordingExecutor::ok("same output"));

        let mut conv = Conversation::new();
        let outcome = engine
            .run_sequential("Loop forever", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.stop, StopReason::DetectorStop);
        // terminated at the repetition tolerance (3), far below the cap (50)
        assert_eq!(outcome.tool_calls_made, 3);
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.response.contains("[loop stopped:"));
    }

    #[tokio::test]
    async fn sequential_hard_cap_enforced() {
        let blocks: Vec<String> = (0..5).map(|i| tool_block(&format!("cmd{i}"))).collect();
        let refs: Vec<&str> = blocks.iter().map(|s| s.as_str()).collect();
        let client = MockClient::sequential(refs);
        let tools = RecordingExecutor::ok("ok");
        let engine = ToolLoop::new(
            Arc::new(client),
            Arc::new(tools),
            ToolLoopConfig {
                hard_cap: 2,
                warn_threshold: 10,
                critical_threshold: 20,
                repeat_tolerance: 3,
                max_result_chars: 8000,
            },
        );

        let mut conv = Conversation::new();
        let outcome = engine
            .run_sequential("Keep going", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.stop, StopReason::HardCap);
        assert_eq!(outcome.tool_calls_made, 2);
        // model calls never exceed hard cap + 1
        assert!(outcome.iterations <= 3);
        assert!(outcome.response.contains("hard iteration cap"));
    }

    #[tokio::test]
    async fn sequential_tool_failure_feeds_back_and_continues() {
        let client = MockClient::sequential(vec![tool_block("boom"), "It failed, sorry.".to_string()]);
        let tools = RecordingExecutor::failing("disk on fire");
        let engine = engine(client, tools);

        let mut conv = Conversation::new();
        let outcome = engine
            .run_sequential("Try it", &mut conv, &LoopOptions::default())
            .await;

        // one tool failure never aborts the loop
        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(outcome.response, "It failed, sorry.");
        assert!(
            conv.messages
                .iter()
                .any(|m| m.content.contains("disk on fire"))
        );
    }

    #[tokio::test]
    async fn sequential_disallowed_tool_rejected_not_executed() {
        let client = MockClient::sequential(vec![tool_block("ls"), "Understood.".to_string()]);
        let tools = RecordingExecutor::ok("should never run");
        let calls = tools.calls.clone();
        let engine = engine(client, tools);

        let options = LoopOptions {
            allowed_tools: Some(HashSet::from(["search".to_string()])),
            ..Default::default()
        };

        let mut conv = Conversation::new();
        let outcome = engine.run_sequential("List files", &mut conv, &options).await;

        assert_eq!(outcome.stop, StopReason::Completed);
        // the executor never saw the call
        assert!(calls.lock().unwrap().is_empty());
        // but the rejection outcome still counts and was fed back
        assert_eq!(outcome.tool_calls_made, 1);
        assert!(
            conv.messages
                .iter()
                .any(|m| m.content.contains("not permitted"))
        );
    }

    #[tokio::test]
    async fn sequential_cancellation_returns_partial() {
        let block = tool_block("slow");
        let client = MockClient::sequential(vec![&block; 5]);
        let cancel = CancellationToken::new();
        let tools = RecordingExecutor::ok("data").cancel_after(1, cancel.clone());
        let engine = engine(client, tools);

        let options = LoopOptions {
            cancel,
            ..Default::default()
        };

        let mut conv = Conversation::new();
        let outcome = engine.run_sequential("Go", &mut conv, &options).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.stop, StopReason::Cancelled);
        // the expensive call was not wasted on another model round-trip
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.response.is_empty());
        assert!(outcome.response.contains("[cancelled"));
    }

    #[tokio::test]
    async fn sequential_pre_cancelled_token_exits_immediately() {
        let client = MockClient::sequential(vec!["never asked"]);
        let engine = engine(client, RecordingExecutor::ok("x"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = LoopOptions {
            cancel,
            ..Default::default()
        };

        let mut conv = Conversation::new();
        let outcome = engine.run_sequential("Go", &mut conv, &options).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.response.is_empty());
    }

    #[tokio::test]
    async fn sequential_model_error_is_terminal_with_classification() {
        let client = MockClient::new(vec![
            ScriptedReply::Text(tool_block("ls")),
            ScriptedReply::Fail(deskclaw_core::ModelError::Network("connection reset".into())),
        ]);
        let engine = engine(client, RecordingExecutor::ok("files"));

        let mut conv = Conversation::new();
        let outcome = engine
            .run_sequential("List", &mut conv, &LoopOptions::default())
            .await;

        assert!(matches!(outcome.stop, StopReason::ModelFailed(_)));
        assert!(outcome.response.contains("connection reset"));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn sequential_steering_lands_in_conversation() {
        let client = MockClient::sequential(vec![tool_block("ls"), "Done.".to_string()]);
        let engine = engine(client, RecordingExecutor::ok("files"));

        let steering = Arc::new(SteeringQueue::new());
        steering.push("Prefer JSON output");
        let options = LoopOptions {
            steering: Some(steering.clone()),
            ..Default::default()
        };

        let mut conv = Conversation::new();
        engine.run_sequential("List", &mut conv, &options).await;

        assert!(
            conv.messages
                .iter()
                .any(|m| m.content == "Prefer JSON output")
        );
        // drained: a second run sees nothing
        assert!(steering.drain().is_empty());
    }

    // ── Batched flavor ──

    #[tokio::test]
    async fn batched_zero_calls_is_single_roundtrip() {
        let client = MockClient::batched(vec![ModelTurn {
            text: "Nothing to do.".into(),
            calls: vec![],
        }]);
        let engine = engine(client, RecordingExecutor::ok("x"));

        let mut conv = Conversation::new();
        let outcome = engine
            .run_batched("Hello", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.response, "Nothing to do.");
        assert_eq!(outcome.stop, StopReason::Completed);
    }

    #[tokio::test]
    async fn batched_sibling_failure_reports_both() {
        let client = MockClient::batched(vec![
            ModelTurn {
                text: "Checking both.".into(),
                calls: vec![
                    make_call("c1", "shell", serde_json::json!({"command": "ls"})),
                    make_call("c2", "search", serde_json::json!({"q": "rust"})),
                ],
            },
            ModelTurn {
                text: "One worked, one failed.".into(),
                calls: vec![],
            },
        ]);
        let tools = RecordingExecutor::scripted(vec![
            Ok(ToolOutcome::ok("listing")),
            Err(deskclaw_core::ToolError::Host("backend down".into())),
        ]);
        let engine = engine(client, tools);

        let mut conv = Conversation::new();
        let outcome = engine
            .run_batched("Check things", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.tool_calls_made, 2);
        assert_eq!(outcome.stop, StopReason::Completed);

        // both outcomes reported in the same turn, correlated by id
        let results: Vec<_> = conv
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(results[1].tool_call_id.as_deref(), Some("c2"));
        assert!(results[1].content.contains("backend down"));
    }

    #[tokio::test]
    async fn batched_stop_verdict_still_executes_siblings() {
        // Three identical calls trip the repetition tolerance on the third;
        // the fourth sibling still executes and reports.
        let same = serde_json::json!({"command": "ls"});
        let client = MockClient::batched(vec![ModelTurn {
            text: "Batch.".into(),
            calls: vec![
                make_call("c1", "shell", same.clone()),
                make_call("c2", "shell", same.clone()),
                make_call("c3", "shell", same.clone()),
                make_call("c4", "search", serde_json::json!({"q": "x"})),
            ],
        }]);
        let tools = RecordingExecutor::ok("same");
        let calls = tools.calls.clone();
        let engine = engine(client, tools);

        let mut conv = Conversation::new();
        let outcome = engine
            .run_batched("Go", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.stop, StopReason::DetectorStop);
        // no further model turn was requested
        assert_eq!(outcome.iterations, 1);
        // all four executed and reported
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert_eq!(
            conv.messages.iter().filter(|m| m.role == Role::Tool).count(),
            4
        );
    }

    #[tokio::test]
    async fn batched_invalid_calls_dropped() {
        let client = MockClient::batched(vec![
            ModelTurn {
                text: String::new(),
                calls: vec![
                    make_call("", "shell", serde_json::json!({})),
                    make_call("c2", "search", serde_json::json!({"q": "ok"})),
                ],
            },
            ModelTurn {
                text: "Done.".into(),
                calls: vec![],
            },
        ]);
        let tools = RecordingExecutor::ok("found");
        let calls = tools.calls.clone();
        let engine = engine(client, tools);

        let mut conv = Conversation::new();
        let outcome = engine
            .run_batched("Go", &mut conv, &LoopOptions::default())
            .await;

        assert_eq!(outcome.tool_calls_made, 1);
        assert_eq!(calls.lock().unwrap()[0].0, "search");
        assert_eq!(outcome.stop, StopReason::Completed);
    }

    #[tokio::test]
    async fn batched_cancellation_abandons_rest_of_batch() {
        let client = MockClient::batched(vec![ModelTurn {
            text: "Batch.".into(),
            calls: vec![
                make_call("c1", "shell", serde_json::json!({"command": "a"})),
                make_call("c2", "shell", serde_json::json!({"command": "b"})),
            ],
        }]);
        let cancel = CancellationToken::new();
        let tools = RecordingExecutor::ok("x").cancel_after(1, cancel.clone());
        let calls = tools.calls.clone();
        let engine = engine(client, tools);

        let options = LoopOptions {
            cancel,
            ..Default::default()
        };

        let mut conv = Conversation::new();
        let outcome = engine.run_batched("Go", &mut conv, &options).await;

        assert!(outcome.cancelled);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!outcome.response.is_empty());
    }

    #[tokio::test]
    async fn batched_allowed_tools_filter_definitions() {
        let client = MockClient::batched(vec![ModelTurn {
            text: "Done.".into(),
            calls: vec![],
        }]);
        let seen_tools = client.seen_tools.clone();
        let engine = engine(client, RecordingExecutor::ok("x"));

        let options = LoopOptions {
            allowed_tools: Some(HashSet::from(["search".to_string()])),
            ..Default::default()
        };

        let mut conv = Conversation::new();
        engine.run_batched("Go", &mut conv, &options).await;

        // the executor knows "shell" and "search"; the model saw only "search"
        let seen = seen_tools.lock().unwrap();
        assert_eq!(seen.as_slice(), [vec!["search".to_string()]]);
    }

    #[tokio::test]
    async fn system_prompt_inserted_once() {
        let client = MockClient::sequential(vec!["Hi.", "Hi again."]);
        let engine = engine(client, RecordingExecutor::ok("x"));

        let options = LoopOptions {
            system_prompt: Some("You are a desktop assistant.".into()),
            ..Default::default()
        };

        let mut conv = Conversation::new();
        engine.run_sequential("Hello", &mut conv, &options).await;
        engine.run_sequential("Hello again", &mut conv, &options).await;

        let systems = conv
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(systems, 1);
        assert_eq!(conv.messages[0].role, Role::System);
    }
}
