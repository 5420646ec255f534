//! External run-invoker boundary.
//!
//! The engine never talks to an LLM runtime directly; it starts runs, waits
//! for their completion, and posts messages into sessions through this trait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Thinking level forwarded to a run. Unrecognized strings fail spawn
/// validation before any invoker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn levels_hint() -> &'static str {
        "off, minimal, low, medium, high"
    }
}

/// Tool allow/deny overrides for a run. Passed to the invoker only; never
/// part of any session patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolOverrides {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl ToolOverrides {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Parameters for starting a subagent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRun {
    pub task: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub spawned_by: String,
    /// System-prompt augmentation describing the child's role and duties.
    pub extra_system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_overrides: Option<ToolOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RunAccepted {
    pub run_id: String,
}

/// Terminal state reported by the invoker for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct RunWait {
    pub status: RunStatus,
    /// Final assistant reply, when the run produced one.
    pub reply: Option<String>,
}

/// A message delivered into a session's timeline (parent notifications,
/// outcome announcements). Delivery is best-effort at every call site.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub session_key: String,
    pub text: String,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Start a run. The session's model must already be patched; the invoker
    /// reads session state to configure the model it uses.
    async fn start_run(&self, params: StartRun) -> Result<RunAccepted>;

    /// Wait for a run to reach a terminal state, bounded by `timeout`.
    async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<RunWait>;

    /// Post a message into a session without triggering delivery to an
    /// external channel.
    async fn post_message(&self, message: SessionMessage) -> Result<()>;
}

/// Split a model ref of the form "provider/model" (or a bare model id).
pub fn split_model_ref(model_ref: &str) -> (Option<&str>, &str) {
    let trimmed = model_ref.trim();
    match trimmed.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            (Some(provider), model)
        }
        _ => (None, trimmed),
    }
}
