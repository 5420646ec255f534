//! Tool for delegating a task to a subagent run.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::subagent::spawn::{SpawnRequest, SubagentOrchestrator};
use crate::tools::{json_result, Tool};

/// `sessions_spawn`: starts a subagent run through the orchestrator and
/// answers with the structured accept/reject details.
pub struct SessionsSpawnTool {
    orchestrator: Arc<SubagentOrchestrator>,
    requester: RwLock<Option<String>>,
}

impl SessionsSpawnTool {
    pub fn new(orchestrator: Arc<SubagentOrchestrator>) -> Self {
        Self {
            orchestrator,
            requester: RwLock::new(None),
        }
    }

    /// Update the requester context so spawned runs announce back to the
    /// right session.
    pub async fn set_context(&self, requester_session_key: &str) {
        *self.requester.write().await = Some(requester_session_key.to_string());
    }
}

#[async_trait]
impl Tool for SessionsSpawnTool {
    fn name(&self) -> &str {
        "sessions_spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to work on a task in its own session. The subagent runs \
         concurrently, may ask you questions via orchestrator requests, and its outcome \
         is announced back here when it finishes. Optionally attach a verification \
         contract describing the artifacts it must produce."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Detailed description of the task for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Short label for identifying this subagent (e.g. 'research-api')"
                },
                "agentId": {
                    "type": "string",
                    "description": "Target agent id for cross-agent spawns (must be allow-listed)"
                },
                "model": {
                    "type": "string",
                    "description": "Model override, 'provider/model' or a bare model id"
                },
                "thinking": {
                    "type": "string",
                    "description": "Thinking level override (off, minimal, low, medium, high)"
                },
                "runTimeoutSeconds": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Max run duration before the run is timed out"
                },
                "completionReport": {
                    "type": "boolean",
                    "description": "Nudge the subagent to file a structured completion report"
                },
                "progressReporting": {
                    "type": "boolean",
                    "description": "Nudge the subagent to report progress as it works"
                },
                "cleanup": {
                    "type": "string",
                    "enum": ["keep", "delete"],
                    "description": "Whether to delete the child session after completion"
                },
                "toolOverrides": {
                    "type": "object",
                    "properties": {
                        "allow": {"type": "array", "items": {"type": "string"}},
                        "deny": {"type": "array", "items": {"type": "string"}}
                    }
                },
                "verification": {
                    "type": "object",
                    "properties": {
                        "artifacts": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": {"type": "string", "minLength": 1},
                                    "json": {"type": "boolean"},
                                    "minItems": {"type": "integer", "minimum": 1},
                                    "requiredKeys": {"type": "array", "items": {"type": "string"}},
                                    "minBytes": {"type": "integer", "minimum": 1}
                                },
                                "required": ["path"]
                            }
                        },
                        "requireCompletionReport": {"type": "boolean"},
                        "onFailure": {"type": "string", "enum": ["retry_once", "escalate", "fail"]},
                        "verificationTimeoutMs": {"type": "integer", "minimum": 1}
                    }
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let Some(requester) = self.requester.read().await.clone() else {
            return json_result(&serde_json::json!({
                "status": "error",
                "error": "No requester context set; cannot spawn.",
            }));
        };

        if !params.is_object() {
            return json_result(&serde_json::json!({
                "status": "error",
                "error": "spawn parameters must be an object",
            }));
        }
        let mut raw = params;
        raw["requesterSessionKey"] = serde_json::Value::String(requester);
        let request: SpawnRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                return json_result(&serde_json::json!({
                    "status": "error",
                    "error": format!("invalid spawn parameters: {e}"),
                }));
            }
        };

        match self.orchestrator.spawn(request).await {
            Ok(accepted) => json_result(&accepted.details()),
            Err(err) => json_result(&err.details()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagent::testing::test_orchestrator;

    #[tokio::test]
    async fn spawn_through_tool_returns_accepted_details() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({}));
        let tool = SessionsSpawnTool::new(orch.clone());
        tool.set_context("agent:main:main").await;

        let result = tool
            .execute(serde_json::json!({
                "task": "summarize the logs",
                "label": "log-summarizer",
                "cleanup": "delete"
            }))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "accepted");
        assert!(parsed["runId"].as_str().unwrap().starts_with("run-"));
        assert_eq!(gateway.started_runs().len(), 1);

        let run = orch.registry().get_run(parsed["runId"].as_str().unwrap()).unwrap();
        assert_eq!(run.label.as_deref(), Some("log-summarizer"));
    }

    #[tokio::test]
    async fn missing_context_is_a_structured_error() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({}));
        let tool = SessionsSpawnTool::new(orch);
        let result = tool
            .execute(serde_json::json!({"task": "anything"}))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "error");
    }

    #[tokio::test]
    async fn spawn_errors_render_as_details_not_failures() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": { "list": [ { "id": "main", "subagents": { "allowAgents": [] } } ] }
        }));
        let tool = SessionsSpawnTool::new(orch);
        tool.set_context("agent:main:main").await;

        let result = tool
            .execute(serde_json::json!({"task": "x", "agentId": "forbidden-agent"}))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "forbidden");
    }
}
