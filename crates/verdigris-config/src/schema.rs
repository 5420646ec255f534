use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Built-in fallbacks when neither an agent entry nor the defaults block
/// provides a value.
pub const DEFAULT_MAX_CHILDREN_PER_AGENT: u32 = 5;
pub const DEFAULT_MAX_SPAWN_DEPTH: u32 = 2;
pub const DEFAULT_RUN_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_PROVIDER_LIMIT: u32 = 4;

/// Provider bucket used when a model's provider is not in the limits map.
pub const UNKNOWN_PROVIDER: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    /// Per-agent entries. An agent absent from this list uses defaults only.
    pub list: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub workspace: String,
    pub subagents: SubagentPolicy,
    /// Max concurrent subagent runs per model provider. Providers not listed
    /// fall back to the "unknown" bucket, then to a built-in limit.
    pub provider_limits: HashMap<String, u32>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.verdigris/workspace".into(),
            subagents: SubagentPolicy::default(),
            provider_limits: HashMap::new(),
        }
    }
}

/// Subagent spawning policy. Every field is optional so per-agent entries can
/// override just the fields they care about.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentPolicy {
    pub max_children_per_agent: Option<u32>,
    pub allow_recursive_spawn: Option<bool>,
    pub max_spawn_depth: Option<u32>,
    pub run_timeout_seconds: Option<u64>,
    /// Default model ref ("provider/model" or bare model id) for spawned
    /// children when the spawn request carries no explicit override.
    pub model: Option<String>,
    /// Default thinking level for spawned children.
    pub thinking: Option<String>,
    /// Agent ids this agent may spawn cross-agent. "*" allows any.
    /// Only meaningful on per-agent entries.
    pub allow_agents: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub id: String,
    pub subagents: Option<SubagentPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Max simultaneously pending orchestrator requests per child.
    pub max_pending_per_child: u32,
    /// Reserved tail of the child's run budget so it can still process the
    /// parent's answer after a request resolves.
    pub safety_buffer_secs: u64,
    pub default_wait_secs: u64,
    pub min_wait_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_pending_per_child: 3,
            safety_buffer_secs: 30,
            default_wait_secs: 300,
            min_wait_secs: 10,
            max_wait_secs: 3600,
        }
    }
}

impl Config {
    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.list.iter().find(|a| a.id == agent_id)
    }

    fn agent_policy(&self, agent_id: &str) -> Option<&SubagentPolicy> {
        self.agent(agent_id).and_then(|a| a.subagents.as_ref())
    }

    pub fn max_children_per_agent(&self, agent_id: &str) -> u32 {
        self.agent_policy(agent_id)
            .and_then(|p| p.max_children_per_agent)
            .or(self.agents.defaults.subagents.max_children_per_agent)
            .unwrap_or(DEFAULT_MAX_CHILDREN_PER_AGENT)
    }

    pub fn allow_recursive_spawn(&self, agent_id: &str) -> bool {
        self.agent_policy(agent_id)
            .and_then(|p| p.allow_recursive_spawn)
            .or(self.agents.defaults.subagents.allow_recursive_spawn)
            .unwrap_or(false)
    }

    pub fn max_spawn_depth(&self, agent_id: &str) -> u32 {
        self.agent_policy(agent_id)
            .and_then(|p| p.max_spawn_depth)
            .or(self.agents.defaults.subagents.max_spawn_depth)
            .unwrap_or(DEFAULT_MAX_SPAWN_DEPTH)
    }

    pub fn run_timeout_seconds(&self, agent_id: &str) -> u64 {
        self.agent_policy(agent_id)
            .and_then(|p| p.run_timeout_seconds)
            .or(self.agents.defaults.subagents.run_timeout_seconds)
            .unwrap_or(DEFAULT_RUN_TIMEOUT_SECONDS)
    }

    pub fn subagent_model(&self, agent_id: &str) -> Option<String> {
        self.agent_policy(agent_id)
            .and_then(|p| p.model.clone())
            .or_else(|| self.agents.defaults.subagents.model.clone())
    }

    pub fn subagent_thinking(&self, agent_id: &str) -> Option<String> {
        self.agent_policy(agent_id)
            .and_then(|p| p.thinking.clone())
            .or_else(|| self.agents.defaults.subagents.thinking.clone())
    }

    /// Cross-agent spawn allow-list for an agent. None means nothing beyond
    /// the agent itself is allowed.
    pub fn allow_agents(&self, agent_id: &str) -> Option<&[String]> {
        self.agent_policy(agent_id)
            .and_then(|p| p.allow_agents.as_deref())
    }

    pub fn provider_limit(&self, provider: &str) -> u32 {
        let limits = &self.agents.defaults.provider_limits;
        limits
            .get(provider)
            .or_else(|| limits.get(UNKNOWN_PROVIDER))
            .copied()
            .unwrap_or(DEFAULT_PROVIDER_LIMIT)
    }
}
