mod loader;
mod schema;

pub use loader::{find_config_path, load_config, resolve_workspace, save_config, state_dir};
pub use schema::{
    AgentConfig, AgentDefaults, AgentsConfig, Config, OrchestratorConfig, SubagentPolicy,
    DEFAULT_MAX_CHILDREN_PER_AGENT, DEFAULT_MAX_SPAWN_DEPTH, DEFAULT_PROVIDER_LIMIT,
    DEFAULT_RUN_TIMEOUT_SECONDS, UNKNOWN_PROVIDER,
};
