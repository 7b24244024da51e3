//! The take-control session state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deskclaw_config::TakeControlConfig;
use deskclaw_core::{
    AutomationError, Capture, ControlAction, ControlActionKind, ControlStep, Conversation,
    DesktopAutomation, LoopObserver, LoopStatus, Message, ModelClient, NoopObserver,
    PointerButton, SessionError,
};

use crate::prune::prune_images;
use crate::vision::{self, VisionCommand};

/// System prompt for the structured-action protocol.
const STRUCTURED_SYSTEM_PROMPT: &str = "You are controlling the user's desktop to complete \
a task. Each turn you receive the latest screenshot. Reply with the next action steps, or \
with no action at all once the task is finished. Coordinates are in screenshot pixels.";

/// System prompt for the vision-fallback protocol.
const VISION_SYSTEM_PROMPT: &str = "You are controlling the user's desktop to complete a \
task. Each turn you receive the latest screenshot. Reply with EXACTLY ONE action line \
(CLICK x y, DOUBLE_CLICK x y, RIGHT_CLICK x y, MOVE x y, TYPE text, KEY combo, \
SCROLL x y dx dy, WAIT ms, SCREENSHOT), or the single line TASK_COMPLETE when finished. \
Coordinates are in screenshot pixels.";

/// Per-session options.
pub struct SessionOptions {
    /// Cooperative cancellation; checked before each decision and around
    /// each executed action.
    pub cancel: CancellationToken,

    /// Progress observer for this session only.
    pub observer: Arc<dyn LoopObserver>,

    /// Taking control of the desktop requires the user's explicit
    /// confirmation; sessions without it are rejected up front.
    pub confirmed: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            observer: Arc::new(NoopObserver),
            confirmed: false,
        }
    }
}

/// How a session ended, for the non-error exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The model stopped requesting actions.
    Completed,
    /// The hard action budget was exhausted.
    BudgetExhausted,
    /// Cancellation was requested.
    Cancelled,
}

/// The result of a finished session. The log is always populated.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Human-readable action log, one line per event.
    pub log: String,

    /// Physical actions executed.
    pub actions_taken: u32,

    /// Whether cancellation ended the session.
    pub cancelled: bool,

    /// Terminal classification.
    pub end: SessionEnd,
}

/// Running session state: the action log and the budget counter.
struct SessionState {
    lines: Vec<String>,
    actions_taken: u32,
}

impl SessionState {
    fn new(task: &str) -> Self {
        Self {
            lines: vec![format!("Take-control session: {task}")],
            actions_taken: 0,
        }
    }

    fn log(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn render(&self, closing: &str) -> String {
        let mut lines = self.lines.clone();
        lines.push(closing.to_string());
        lines.join("\n")
    }

    fn finish(&self, end: SessionEnd) -> SessionOutcome {
        let closing = match end {
            SessionEnd::Completed => "[session complete]".to_string(),
            SessionEnd::BudgetExhausted => format!(
                "[action budget exhausted after {} actions]",
                self.actions_taken
            ),
            SessionEnd::Cancelled => "[cancelled at user request]".to_string(),
        };
        SessionOutcome {
            log: self.render(&closing),
            actions_taken: self.actions_taken,
            cancelled: end == SessionEnd::Cancelled,
            end,
        }
    }
}

/// Drives one take-control session per [`run`](TakeControlEngine::run) call.
pub struct TakeControlEngine {
    client: Arc<dyn ModelClient>,
    automation: Arc<dyn DesktopAutomation>,
    config: TakeControlConfig,
}

impl TakeControlEngine {
    pub fn new(
        client: Arc<dyn ModelClient>,
        automation: Arc<dyn DesktopAutomation>,
        config: TakeControlConfig,
    ) -> Self {
        Self {
            client,
            automation,
            config,
        }
    }

    /// Run a session for `task` until the model finishes, the budget runs
    /// out, cancellation is requested, or a protocol/model failure aborts it.
    pub async fn run(
        &self,
        task: &str,
        options: &SessionOptions,
    ) -> Result<SessionOutcome, SessionError> {
        if !options.confirmed {
            return Err(SessionError::NotConfirmed);
        }

        options.observer.on_status(LoopStatus::Started);
        let outcome = if self.client.supports_computer_use() {
            info!(task, "Starting take-control session (structured protocol)");
            self.run_structured(task, options).await
        } else {
            info!(task, "Starting take-control session (vision fallback)");
            self.run_vision(task, options).await
        };
        options.observer.on_status(LoopStatus::Finished);
        outcome
    }

    // ── Structured-action protocol ──

    async fn run_structured(
        &self,
        task: &str,
        options: &SessionOptions,
    ) -> Result<SessionOutcome, SessionError> {
        let mut conversation = Conversation::new();
        conversation.push(Message::user(format!("Task: {task}")));
        let mut state = SessionState::new(task);

        loop {
            // checkpoint: before each decision
            if options.cancel.is_cancelled() {
                return Ok(state.finish(SessionEnd::Cancelled));
            }

            let capture = self.capture(&mut state).await?;
            conversation.push(Message::user_with_image(
                "Current screen:",
                capture.image.clone(),
            ));
            prune_images(&mut conversation, self.config.keep_screenshots);

            options.observer.on_status(LoopStatus::Thinking);
            let steps = match self
                .client
                .decide_action(
                    STRUCTURED_SYSTEM_PROMPT,
                    &conversation,
                    (capture.width, capture.height),
                )
                .await
            {
                Ok(steps) => steps,
                Err(e) => {
                    warn!(error = %e, "Model decision failed, aborting session");
                    return Err(SessionError::Model {
                        source: e,
                        log: state.render("[aborted: model call failed]"),
                    });
                }
            };

            let mut actions: Vec<ControlAction> = Vec::new();
            for step in steps {
                match step {
                    ControlStep::Note(text) => {
                        options.observer.on_text(&text);
                        state.log(&text);
                        conversation.push(Message::assistant(text));
                    }
                    ControlStep::Act(action) => actions.push(action),
                }
            }

            // No action step this turn: the task is done. This also covers
            // an empty turn after prior actions — implicit completion.
            if actions.is_empty() {
                return Ok(state.finish(SessionEnd::Completed));
            }

            options.observer.on_status(LoopStatus::Acting);
            let mut executed_lines: Vec<String> = Vec::new();
            for action in &actions {
                // checkpoints: before and after each execution
                if options.cancel.is_cancelled() {
                    return Ok(state.finish(SessionEnd::Cancelled));
                }

                if self
                    .execute_action(&capture, action, &mut state, options)
                    .await?
                {
                    executed_lines.push(action.describe());
                }

                if options.cancel.is_cancelled() {
                    return Ok(state.finish(SessionEnd::Cancelled));
                }

                if state.actions_taken >= self.config.action_budget {
                    return Ok(state.finish(SessionEnd::BudgetExhausted));
                }

                self.settle(action.kind).await;
            }

            if !executed_lines.is_empty() {
                conversation.push(Message::assistant(format!(
                    "Executed: {}",
                    executed_lines.join("; ")
                )));
            }
        }
    }

    // ── Vision-fallback protocol ──

    async fn run_vision(
        &self,
        task: &str,
        options: &SessionOptions,
    ) -> Result<SessionOutcome, SessionError> {
        let mut conversation = Conversation::new();
        conversation.push(Message::system(VISION_SYSTEM_PROMPT));
        conversation.push(Message::user(format!("Task: {task}")));
        let mut state = SessionState::new(task);
        let mut text_retries = 0u32;

        loop {
            if options.cancel.is_cancelled() {
                return Ok(state.finish(SessionEnd::Cancelled));
            }

            let capture = self.capture(&mut state).await?;
            conversation.push(Message::user_with_image(
                vision_turn_prompt(text_retries),
                capture.image.clone(),
            ));
            prune_images(&mut conversation, self.config.keep_screenshots);

            options.observer.on_status(LoopStatus::Thinking);
            let reply = match self.client.ask(&conversation).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Model call failed, aborting session");
                    return Err(SessionError::Model {
                        source: e,
                        log: state.render("[aborted: model call failed]"),
                    });
                }
            };
            conversation.push(Message::assistant(&reply));

            match vision::parse_reply(&reply) {
                Some(VisionCommand::Complete) => {
                    return Ok(state.finish(SessionEnd::Completed));
                }
                Some(VisionCommand::Act(action)) => {
                    text_retries = 0;
                    options.observer.on_status(LoopStatus::Acting);

                    if options.cancel.is_cancelled() {
                        return Ok(state.finish(SessionEnd::Cancelled));
                    }

                    self.execute_action(&capture, &action, &mut state, options)
                        .await?;

                    if options.cancel.is_cancelled() {
                        return Ok(state.finish(SessionEnd::Cancelled));
                    }

                    if state.actions_taken >= self.config.action_budget {
                        return Ok(state.finish(SessionEnd::BudgetExhausted));
                    }

                    self.settle(action.kind).await;
                }
                None => {
                    text_retries += 1;
                    debug!(text_retries, "Vision reply contained no action");
                    state.log(format!(
                        "model reply contained no parseable action ({text_retries})"
                    ));
                    if text_retries >= self.config.text_retry_budget {
                        warn!(
                            retries = text_retries,
                            "Vision protocol failed, aborting session"
                        );
                        return Err(SessionError::ProtocolFailure {
                            retries: text_retries,
                            log: state.render("[aborted: model kept answering in prose]"),
                        });
                    }
                }
            }
        }
    }

    // ── Shared pieces ──

    async fn capture(&self, state: &mut SessionState) -> Result<Capture, SessionError> {
        self.automation.capture().await.map_err(|e| {
            warn!(error = %e, "Screen capture failed, aborting session");
            SessionError::Automation {
                source: e,
                log: state.render("[aborted: screen capture failed]"),
            }
        })
    }

    /// Execute one action, remapping its coordinate with the scale factors
    /// of the capture the model just saw. Returns false when the action was
    /// malformed and skipped.
    async fn execute_action(
        &self,
        capture: &Capture,
        action: &ControlAction,
        state: &mut SessionState,
        options: &SessionOptions,
    ) -> Result<bool, SessionError> {
        let result = self.dispatch(capture, action).await;
        match result {
            Ok(true) => {
                state.actions_taken += 1;
                let description = action.describe();
                options.observer.on_action(&description);
                state.log(format!("→ {description}"));
                Ok(true)
            }
            Ok(false) => {
                state.log(format!(
                    "skipped malformed action: {}",
                    action.describe()
                ));
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "Automation failed, aborting session");
                Err(SessionError::Automation {
                    source: e,
                    log: state.render("[aborted: input injection failed]"),
                })
            }
        }
    }

    /// Route an action to the automation primitives. Ok(false) = skipped.
    async fn dispatch(
        &self,
        capture: &Capture,
        action: &ControlAction,
    ) -> Result<bool, AutomationError> {
        let native = action.coordinate.map(|(x, y)| capture.to_native(x, y));

        match action.kind {
            ControlActionKind::Click => match native {
                Some((x, y)) => self.automation.click(x, y, PointerButton::Left).await?,
                None => return Ok(false),
            },
            ControlActionKind::DoubleClick => match native {
                Some((x, y)) => self.automation.double_click(x, y).await?,
                None => return Ok(false),
            },
            ControlActionKind::RightClick => match native {
                Some((x, y)) => self.automation.click(x, y, PointerButton::Right).await?,
                None => return Ok(false),
            },
            ControlActionKind::MoveMouse => match native {
                Some((x, y)) => self.automation.move_pointer(x, y).await?,
                None => return Ok(false),
            },
            ControlActionKind::Type => match &action.text {
                Some(text) => self.automation.type_text(text).await?,
                None => return Ok(false),
            },
            ControlActionKind::Key => match &action.text {
                Some(combo) => self.automation.press_key(combo).await?,
                None => return Ok(false),
            },
            ControlActionKind::Scroll => match (native, action.scroll) {
                (Some((x, y)), Some((dx, dy))) => self.automation.scroll(x, y, dx, dy).await?,
                _ => return Ok(false),
            },
            ControlActionKind::Screenshot => {
                // no-op: the loop re-captures right after the settle delay
            }
            ControlActionKind::Wait => {
                let ms = action.duration_ms.unwrap_or(500).min(5_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        Ok(true)
    }

    /// Fixed pause before the next capture so the UI can stabilize.
    async fn settle(&self, kind: ControlActionKind) {
        let ms = if kind == ControlActionKind::Screenshot {
            self.config.screenshot_settle_delay_ms
        } else {
            self.config.settle_delay_ms
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// The vision prompt gets more forceful with each unparseable reply.
fn vision_turn_prompt(text_retries: u32) -> String {
    match text_retries {
        0 => "Current screen. Reply with one action line or TASK_COMPLETE.".to_string(),
        1 => "Your last reply contained no action. Reply with ONLY one action line \
              (e.g. CLICK 400 300) or TASK_COMPLETE, nothing else."
            .to_string(),
        _ => "FINAL WARNING: reply with exactly one action line or TASK_COMPLETE. \
              Any other reply ends this session."
            .to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
