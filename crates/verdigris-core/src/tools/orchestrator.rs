//! Child/parent tools for orchestrator requests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::subagent::mediator::{OrchestratorMediator, RequestParams, RequestPriority};
use crate::tools::{json_result, Tool};

/// `request_orchestrator`: a child's blocking question to its parent.
/// Suspends the calling tool invocation until the parent responds, the wait
/// elapses, or the run is aborted.
pub struct RequestOrchestratorTool {
    mediator: Arc<OrchestratorMediator>,
    child_session_key: String,
}

impl RequestOrchestratorTool {
    pub fn new(mediator: Arc<OrchestratorMediator>, child_session_key: &str) -> Self {
        Self {
            mediator,
            child_session_key: child_session_key.to_string(),
        }
    }
}

#[async_trait]
impl Tool for RequestOrchestratorTool {
    fn name(&self) -> &str {
        "request_orchestrator"
    }

    fn description(&self) -> &str {
        "Request input from the parent orchestrator. Blocks until the parent \
         responds, times out, or the run is aborted."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Question or request for the parent orchestrator"
                },
                "context": {
                    "type": "string",
                    "description": "Additional context (file paths, data, partial results)"
                },
                "timeoutSeconds": {
                    "type": "integer",
                    "minimum": 10,
                    "maximum": 3600,
                    "description": "Max wait time. Default: 300"
                },
                "priority": {
                    "type": "string",
                    "enum": ["normal", "high"]
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: message"))?;
        let context = params
            .get("context")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let timeout_seconds = params.get("timeoutSeconds").and_then(|v| v.as_u64());
        let priority = match params.get("priority").and_then(|v| v.as_str()) {
            Some("high") => RequestPriority::High,
            _ => RequestPriority::Normal,
        };

        let outcome = self
            .mediator
            .request(
                &self.child_session_key,
                RequestParams {
                    message: message.to_string(),
                    context,
                    timeout_seconds,
                    priority,
                },
            )
            .await;
        json_result(&outcome)
    }
}

/// `respond_orchestrator_request`: parent-side resolution of a pending
/// request by id.
pub struct RespondOrchestratorRequestTool {
    mediator: Arc<OrchestratorMediator>,
    parent_session_key: String,
}

impl RespondOrchestratorRequestTool {
    pub fn new(mediator: Arc<OrchestratorMediator>, parent_session_key: &str) -> Self {
        Self {
            mediator,
            parent_session_key: parent_session_key.to_string(),
        }
    }
}

#[async_trait]
impl Tool for RespondOrchestratorRequestTool {
    fn name(&self) -> &str {
        "respond_orchestrator_request"
    }

    fn description(&self) -> &str {
        "Respond to a pending orchestrator request from a child subagent."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "requestId": {"type": "string", "minLength": 1},
                "response": {"type": "string", "minLength": 1}
            },
            "required": ["requestId", "response"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let request_id = params
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: requestId"))?;
        let response = params
            .get("response")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: response"))?;

        let outcome = self
            .mediator
            .respond(request_id, response, &self.parent_session_key);
        json_result(&outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagent::testing::{register_run, test_world};

    #[tokio::test]
    async fn request_tool_reports_mediator_errors_as_json() {
        let (mediator, _registry, _gateway, _sessions) = test_world();
        let tool = RequestOrchestratorTool::new(mediator, "agent:main:main");
        let result = tool
            .execute(serde_json::json!({"message": "help me"}))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "error");
        assert!(parsed["error"]
            .as_str()
            .unwrap()
            .contains("only available to subagent"));
    }

    #[tokio::test]
    async fn round_trip_between_child_and_parent_tools() {
        let (mediator, registry, gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let child_tool =
            RequestOrchestratorTool::new(mediator.clone(), "agent:main:subagent:a");
        let waiter = tokio::spawn(async move {
            child_tool
                .execute(serde_json::json!({"message": "proceed with plan B?"}))
                .await
                .unwrap()
        });

        let note = gateway.wait_for_post().await;
        let request_id = note
            .text
            .lines()
            .next()
            .unwrap()
            .trim_start_matches("[subagent_request requestId=")
            .trim_end_matches(']')
            .to_string();

        let parent_tool = RespondOrchestratorRequestTool::new(mediator, "agent:main:main");
        let respond = parent_tool
            .execute(serde_json::json!({"requestId": request_id, "response": "yes, plan B"}))
            .await
            .unwrap();
        let respond: serde_json::Value = serde_json::from_str(&respond).unwrap();
        assert_eq!(respond["status"], "ok");

        let outcome: serde_json::Value =
            serde_json::from_str(&waiter.await.unwrap()).unwrap();
        assert_eq!(outcome["status"], "resolved");
        assert_eq!(outcome["response"], "yes, plan B");
    }

    #[tokio::test]
    async fn respond_tool_surfaces_not_found() {
        let (mediator, _registry, _gateway, _sessions) = test_world();
        let tool = RespondOrchestratorRequestTool::new(mediator, "agent:main:main");
        let result = tool
            .execute(serde_json::json!({"requestId": "nope", "response": "hello"}))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "not_found");
    }
}
