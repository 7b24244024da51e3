//! Configuration for the deskclaw orchestration engines.
//!
//! Caps, thresholds, and budgets are never ambient constants: every engine
//! and manager takes an explicit config struct at construction, so tests
//! can exercise small caps deterministically. Configuration loads from a
//! TOML file with per-field defaults and is validated before use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration for all loop engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Tool-calling loop engine settings
    #[serde(default)]
    pub tool_loop: ToolLoopConfig,

    /// Sub-agent pool settings
    #[serde(default)]
    pub subagents: SubAgentsConfig,

    /// Take-control session settings
    #[serde(default)]
    pub take_control: TakeControlConfig,
}

/// Settings for one tool-calling loop instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    /// Absolute ceiling on tool executions per loop, independent of any
    /// heuristic. The loop terminates unconditionally once hit.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: u32,

    /// Iteration count at which the detector starts attaching corrective
    /// nudges to repeated calls.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: u32,

    /// Iteration count at or above which the detector forces termination.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,

    /// Consecutive identical call fingerprints tolerated before the
    /// detector forces termination.
    #[serde(default = "default_repeat_tolerance")]
    pub repeat_tolerance: u32,

    /// Maximum characters of tool output fed back to the model per call.
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

fn default_hard_cap() -> u32 {
    50
}
fn default_warn_threshold() -> u32 {
    15
}
fn default_critical_threshold() -> u32 {
    30
}
fn default_repeat_tolerance() -> u32 {
    3
}
fn default_max_result_chars() -> usize {
    8000
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            hard_cap: default_hard_cap(),
            warn_threshold: default_warn_threshold(),
            critical_threshold: default_critical_threshold(),
            repeat_tolerance: default_repeat_tolerance(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

/// Settings for the bounded sub-agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentsConfig {
    /// Maximum concurrently running sub-agents.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-sub-agent tool-loop hard cap (tighter than the main loop's).
    #[serde(default = "default_subagent_iterations")]
    pub max_iterations: u32,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_subagent_iterations() -> u32 {
    15
}

impl Default for SubAgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_iterations: default_subagent_iterations(),
        }
    }
}

/// Settings for take-control (computer-use) sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeControlConfig {
    /// Absolute ceiling on physical actions per session.
    #[serde(default = "default_action_budget")]
    pub action_budget: u32,

    /// Consecutive unparseable vision-protocol turns tolerated before the
    /// session aborts as a protocol failure.
    #[serde(default = "default_text_retry_budget")]
    pub text_retry_budget: u32,

    /// How many of the most recent screenshots stay in the conversation;
    /// older ones are replaced with a textual placeholder.
    #[serde(default = "default_keep_screenshots")]
    pub keep_screenshots: usize,

    /// Settle delay after an interactive action, milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Settle delay after the no-op screenshot action, milliseconds.
    #[serde(default = "default_screenshot_settle_delay_ms")]
    pub screenshot_settle_delay_ms: u64,
}

fn default_action_budget() -> u32 {
    30
}
fn default_text_retry_budget() -> u32 {
    3
}
fn default_keep_screenshots() -> usize {
    3
}
fn default_settle_delay_ms() -> u64 {
    800
}
fn default_screenshot_settle_delay_ms() -> u64 {
    150
}

impl Default for TakeControlConfig {
    fn default() -> Self {
        Self {
            action_budget: default_action_budget(),
            text_retry_budget: default_text_retry_budget(),
            keep_screenshots: default_keep_screenshots(),
            settle_delay_ms: default_settle_delay_ms(),
            screenshot_settle_delay_ms: default_screenshot_settle_delay_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate threshold ordering and budget sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tl = &self.tool_loop;
        if tl.hard_cap == 0 {
            return Err(ConfigError::ValidationError("hard_cap must be > 0".into()));
        }
        if tl.warn_threshold >= tl.critical_threshold {
            return Err(ConfigError::ValidationError(
                "warn_threshold must be below critical_threshold".into(),
            ));
        }
        if tl.critical_threshold > tl.hard_cap {
            return Err(ConfigError::ValidationError(
                "critical_threshold must not exceed hard_cap".into(),
            ));
        }
        if tl.repeat_tolerance < 2 {
            return Err(ConfigError::ValidationError(
                "repeat_tolerance must be at least 2".into(),
            ));
        }

        if self.subagents.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "subagents.max_concurrent must be > 0".into(),
            ));
        }

        let tc = &self.take_control;
        if tc.action_budget == 0 {
            return Err(ConfigError::ValidationError(
                "take_control.action_budget must be > 0".into(),
            ));
        }
        if tc.keep_screenshots == 0 {
            return Err(ConfigError::ValidationError(
                "take_control.keep_screenshots must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for onboarding).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tool_loop: ToolLoopConfig::default(),
            subagents: SubAgentsConfig::default(),
            take_control: TakeControlConfig::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
