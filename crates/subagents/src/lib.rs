//! Bounded concurrent sub-agent pool.
//!
//! A sub-agent is an isolated tool-calling loop running in the background:
//! its own conversation, its own loop detector, and an optionally restricted
//! tool set. The manager owns every sub-agent for its entire lifetime,
//! bounds how many run concurrently, and reports completions asynchronously
//! through a result buffer and an optional callback.
//!
//! Sub-agents provide no ordering guarantee relative to each other or to
//! the main loop. The only shared mutable state between them is the pool
//! counter and the completed-results buffer, both manager-owned and
//! mutex-protected; the active set and the completed buffer are disjoint
//! by construction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deskclaw_agent::{LoopOptions, SteeringQueue, StopReason, ToolLoop};
use deskclaw_config::{SubAgentsConfig, ToolLoopConfig};
use deskclaw_core::{
    Conversation, LoopObserver, LoopStatus, ModelClient, SpawnError, ToolExecutor,
};

/// System prompt given to every sub-agent.
const SUBAGENT_SYSTEM_PROMPT: &str = "You are an autonomous sub-agent. Complete the \
delegated task using the available tools, then reply with a concise report of what \
you did and found.";

/// Lifecycle states of a sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    /// Created, background routine not yet running.
    Pending,
    /// Background routine executing.
    Running,
    /// Finished naturally or via the iteration cap.
    Completed,
    /// The model client failed.
    Failed,
    /// Terminated by an explicit kill.
    Killed,
}

/// Immutable snapshot of a finished sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub id: String,
    pub status: SubAgentStatus,
    /// Final (or best partial) response text.
    pub output: String,
    /// Distinct tool names used, in first-use order.
    pub tools_used: Vec<String>,
    /// Model round-trips performed.
    pub iterations: u32,
    pub duration_ms: u64,
}

/// Point-in-time view of a running sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentSummary {
    pub id: String,
    pub task: String,
    pub status: SubAgentStatus,
    /// Model round-trips so far.
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
}

/// Callback invoked when a sub-agent reaches a terminal state.
pub type CompletionCallback = Arc<dyn Fn(&SubAgentResult) + Send + Sync>;

/// Handle kept in the active set for each live sub-agent.
struct ActiveAgent {
    task: String,
    status: SubAgentStatus,
    cancel: CancellationToken,
    steering: Arc<SteeringQueue>,
    iterations: Arc<AtomicU32>,
    started_at: DateTime<Utc>,
}

struct ManagerState {
    active: Mutex<HashMap<String, ActiveAgent>>,
    completed: Mutex<Vec<SubAgentResult>>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

/// Owns and bounds the pool of concurrently running sub-agents.
pub struct SubAgentManager {
    client: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    config: SubAgentsConfig,
    loop_config: ToolLoopConfig,
    state: Arc<ManagerState>,
}

impl SubAgentManager {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
        config: SubAgentsConfig,
        loop_config: ToolLoopConfig,
    ) -> Self {
        Self {
            client,
            tools,
            config,
            loop_config,
            state: Arc::new(ManagerState {
                active: Mutex::new(HashMap::new()),
                completed: Mutex::new(Vec::new()),
                on_complete: Mutex::new(None),
            }),
        }
    }

    /// Register a callback fired on every sub-agent completion.
    pub fn with_completion_callback(self, callback: CompletionCallback) -> Self {
        *self.state.on_complete.lock().unwrap() = Some(callback);
        self
    }

    /// Spawn a new sub-agent for `task`, optionally restricted to
    /// `allowed_tools`. Returns the sub-agent id immediately; execution
    /// happens in the background.
    ///
    /// Rejected synchronously, before any state mutation, when the pool is
    /// at capacity or the task is empty.
    pub fn spawn(
        &self,
        task: &str,
        allowed_tools: Option<HashSet<String>>,
    ) -> Result<String, SpawnError> {
        if task.trim().is_empty() {
            return Err(SpawnError::EmptyTask);
        }

        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let steering = Arc::new(SteeringQueue::new());
        let iterations = Arc::new(AtomicU32::new(0));

        {
            let mut active = self.state.active.lock().unwrap();
            if active.len() >= self.config.max_concurrent {
                return Err(SpawnError::CapacityExceeded {
                    active: active.len(),
                    max: self.config.max_concurrent,
                });
            }
            active.insert(
                id.clone(),
                ActiveAgent {
                    task: task.to_string(),
                    status: SubAgentStatus::Pending,
                    cancel: cancel.clone(),
                    steering: steering.clone(),
                    iterations: iterations.clone(),
                    started_at: Utc::now(),
                },
            );
        }

        info!(subagent_id = %id, "Spawning sub-agent");

        // Per-sub-agent loops run under a tighter iteration cap.
        let mut loop_config = self.loop_config.clone();
        loop_config.hard_cap = loop_config.hard_cap.min(self.config.max_iterations);

        let client = self.client.clone();
        let tools = self.tools.clone();
        let state = self.state.clone();
        let task = task.to_string();
        let agent_id = id.clone();

        tokio::spawn(async move {
            run_agent(
                agent_id,
                task,
                allowed_tools,
                client,
                tools,
                loop_config,
                cancel,
                steering,
                iterations,
                state,
            )
            .await;
        });

        Ok(id)
    }

    /// Request termination of a running sub-agent.
    ///
    /// Cancellation is cooperative: the agent stops at its next checkpoint.
    /// Returns false (an idempotent no-op, not an error) when the id is not
    /// currently active.
    pub fn kill(&self, id: &str) -> bool {
        let active = self.state.active.lock().unwrap();
        match active.get(id) {
            Some(agent) => {
                info!(subagent_id = %id, "Kill requested");
                agent.cancel.cancel();
                true
            }
            None => {
                debug!(subagent_id = %id, "Kill requested for inactive sub-agent");
                false
            }
        }
    }

    /// Queue an out-of-band instruction for a running sub-agent, picked up
    /// before its next model round-trip. Best-effort: an agent about to
    /// finish may complete without seeing it.
    pub fn steer(&self, id: &str, instruction: &str) -> bool {
        let active = self.state.active.lock().unwrap();
        match active.get(id) {
            Some(agent) => {
                agent.steering.push(instruction);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live sub-agents.
    pub fn list_active(&self) -> Vec<SubAgentSummary> {
        self.state
            .active
            .lock()
            .unwrap()
            .iter()
            .map(|(id, agent)| SubAgentSummary {
                id: id.clone(),
                task: agent.task.clone(),
                status: agent.status,
                iterations: agent.iterations.load(Ordering::Relaxed),
                started_at: agent.started_at,
            })
            .collect()
    }

    /// Number of live sub-agents.
    pub fn active_count(&self) -> usize {
        self.state.active.lock().unwrap().len()
    }

    /// Drain the completed-results buffer.
    pub fn consume_completed(&self) -> Vec<SubAgentResult> {
        std::mem::take(&mut *self.state.completed.lock().unwrap())
    }
}

/// Counts model round-trips for the live summary.
struct CountingObserver {
    iterations: Arc<AtomicU32>,
}

impl LoopObserver for CountingObserver {
    fn on_status(&self, status: LoopStatus) {
        if status == LoopStatus::Thinking {
            self.iterations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The background execution routine for one sub-agent.
#[allow(clippy::too_many_arguments)]
async fn run_agent(
    id: String,
    task: String,
    allowed_tools: Option<HashSet<String>>,
    client: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    loop_config: ToolLoopConfig,
    cancel: CancellationToken,
    steering: Arc<SteeringQueue>,
    iterations: Arc<AtomicU32>,
    state: Arc<ManagerState>,
) {
    if let Some(agent) = state.active.lock().unwrap().get_mut(&id) {
        agent.status = SubAgentStatus::Running;
    }

    let engine = ToolLoop::new(client, tools, loop_config);
    let options = LoopOptions {
        cancel,
        observer: Arc::new(CountingObserver {
            iterations: iterations.clone(),
        }),
        allowed_tools,
        steering: Some(steering),
        system_prompt: Some(SUBAGENT_SYSTEM_PROMPT.to_string()),
    };

    // Isolated conversation: no history shared with the caller.
    let mut conversation = Conversation::new();
    let started = Instant::now();
    let outcome = engine.run_sequential(&task, &mut conversation, &options).await;

    let status = match outcome.stop {
        StopReason::Cancelled => SubAgentStatus::Killed,
        StopReason::ModelFailed(_) => SubAgentStatus::Failed,
        _ => SubAgentStatus::Completed,
    };

    if status == SubAgentStatus::Failed {
        warn!(subagent_id = %id, "Sub-agent failed");
    }

    let result = SubAgentResult {
        id: id.clone(),
        status,
        output: outcome.response,
        tools_used: outcome.tools_used,
        iterations: outcome.iterations,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    // One atomic transition: the agent leaves the active set in the same
    // critical section its result enters the buffer, so the two
    // collections stay disjoint and the agent is never in neither.
    {
        let mut active = state.active.lock().unwrap();
        let mut completed = state.completed.lock().unwrap();
        active.remove(&id);
        completed.push(result.clone());
    }

    let callback = state.on_complete.lock().unwrap().clone();
    if let Some(callback) = callback {
        callback(&result);
    }

    info!(
        subagent_id = %id,
        status = ?result.status,
        iterations = result.iterations,
        duration_ms = result.duration_ms,
        "Sub-agent finished"
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────
