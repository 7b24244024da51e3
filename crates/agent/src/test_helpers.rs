//! Shared test helpers for loop-engine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deskclaw_core::{
    Conversation, ModelClient, ModelError, ModelTurn, ToolCall, ToolDefinition, ToolError,
    ToolExecutor, ToolOutcome,
};

/// One scripted model reply.
pub(crate) enum ScriptedReply {
    /// Plain text, served by `ask`.
    Text(String),
    /// A structured turn, served by `ask_with_tools`.
    Turn(ModelTurn),
    /// A model failure, served by either method.
    Fail(ModelError),
}

/// A mock model client that returns a sequence of scripted replies.
///
/// Panics when more calls are made than replies provided — exhaustion in a
/// test means the loop ran longer than it should have.
pub(crate) struct MockClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    /// Tool names advertised on each `ask_with_tools` call.
    pub seen_tools: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen_tools: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script plain-text replies for the sequential flavor.
    pub fn sequential<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|t| ScriptedReply::Text(t.as_ref().to_string()))
                .collect(),
        )
    }

    /// Script structured turns for the batched flavor.
    pub fn batched(turns: Vec<ModelTurn>) -> Self {
        Self::new(turns.into_iter().map(ScriptedReply::Turn).collect())
    }

    fn next(&self) -> ScriptedReply {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("MockClient: no more scripted replies")
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ask(&self, _conversation: &Conversation) -> Result<String, ModelError> {
        match self.next() {
            ScriptedReply::Text(t) => Ok(t),
            ScriptedReply::Fail(e) => Err(e),
            ScriptedReply::Turn(_) => panic!("MockClient: ask() got a structured turn"),
        }
    }

    async fn ask_with_tools(
        &self,
        _conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, ModelError> {
        self.seen_tools
            .lock()
            .unwrap()
            .push(tools.iter().map(|d| d.name.clone()).collect());
        match self.next() {
            ScriptedReply::Turn(t) => Ok(t),
            ScriptedReply::Text(t) => Ok(ModelTurn {
                text: t,
                calls: vec![],
            }),
            ScriptedReply::Fail(e) => Err(e),
        }
    }
}

/// A tool executor that records every call and serves scripted outcomes.
pub(crate) struct RecordingExecutor {
    script: Mutex<VecDeque<Result<ToolOutcome, ToolError>>>,
    default_output: String,
    fail_with: Option<String>,
    /// (name, arguments) of every executed call, in order.
    pub calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl RecordingExecutor {
    /// Always succeed with the given output.
    pub fn ok(output: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_output: output.to_string(),
            fail_with: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            cancel_after: Mutex::new(None),
        }
    }

    /// Always raise a host error with the given reason.
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Self::ok("")
        }
    }

    /// Serve these results first, then fall back to the default.
    pub fn scripted(script: Vec<Result<ToolOutcome, ToolError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::ok("done")
        }
    }

    /// Cancel the token once `n` calls have executed.
    pub fn cancel_after(self, n: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((n, token));
        self
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        ["shell", "search"]
            .iter()
            .map(|name| ToolDefinition {
                name: name.to_string(),
                description: format!("test tool {name}"),
                parameters: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));

        let executed = self.calls.lock().unwrap().len();
        if let Some((n, token)) = &*self.cancel_after.lock().unwrap()
            && executed >= *n
        {
            token.cancel();
        }

        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }

        match &self.fail_with {
            Some(reason) => Err(ToolError::Host(reason.clone())),
            None => Ok(ToolOutcome::ok(&self.default_output)),
        }
    }
}

/// Build a structured tool call for batched-flavor scripts.
pub(crate) fn make_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}
