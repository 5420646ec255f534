//! Spawn orchestrator: validates a spawn request against policy, reserves
//! concurrency slots, prepares the child session, invokes the run, and
//! registers it. Every reserved slot is released exactly once: on the error
//! path here, or when the run later retires (announce flow).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use verdigris_config::Config;

use crate::gateway::{split_model_ref, Gateway, StartRun, ThinkLevel, ToolOverrides};
use crate::report::CompletionReportBook;
use crate::session::{SessionPatch, SessionStore};
use crate::session_key;

use super::announce::build_subagent_system_prompt;
use super::registry::{
    CleanupPolicy, RunHandles, RunRegistry, SubagentRun, VerificationState,
};
use super::slots::ProviderReservation;
use super::verification::VerificationContract;

/// Extra slack on top of the child's own run timeout when waiting for the
/// invoker to report a terminal state.
const WAIT_GRACE: Duration = Duration::from_secs(60);

/// A request to delegate a task to a subagent run. Also persisted verbatim
/// as `originalSpawnParams` so a verification retry can reproduce the spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub task: String,
    pub requester_session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Target agent id for cross-agent spawns. Defaults to the requester's
    /// own agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub completion_report: bool,
    #[serde(default)]
    pub progress_reporting: bool,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_overrides: Option<ToolOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationContract>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnAccepted {
    pub run_id: String,
    pub child_session_key: String,
    pub model_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl SpawnAccepted {
    pub fn details(&self) -> serde_json::Value {
        let mut details = serde_json::json!({
            "status": "accepted",
            "runId": self.run_id,
            "childSessionKey": self.child_session_key,
            "modelApplied": self.model_applied,
        });
        if let Some(warning) = &self.warning {
            details["warning"] = serde_json::Value::String(warning.clone());
        }
        details
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    ParentLimit,
    ProviderLimit,
}

impl BlockedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParentLimit => "parent_limit",
            Self::ProviderLimit => "provider_limit",
        }
    }
}

/// Typed spawn failure. `details()` is the machine-readable shape tools
/// render back to the model.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("{message}")]
    Forbidden { message: String },
    #[error("{message}")]
    Blocked {
        reason: BlockedReason,
        provider: Option<String>,
        active: u32,
        limit: u32,
        message: String,
    },
    #[error("{message}")]
    Invalid {
        message: String,
        child_session_key: Option<String>,
    },
}

impl SpawnError {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Forbidden { .. } => "forbidden",
            Self::Blocked { .. } => "blocked",
            Self::Invalid { .. } => "error",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::Forbidden { message } => serde_json::json!({
                "status": "forbidden",
                "error": message,
            }),
            Self::Blocked {
                reason,
                provider,
                active,
                limit,
                message,
            } => {
                let mut details = serde_json::json!({
                    "status": "blocked",
                    "reason": reason.as_str(),
                    "active": active,
                    "maxConcurrent": limit,
                    "error": message,
                });
                if let Some(provider) = provider {
                    details["provider"] = serde_json::Value::String(provider.clone());
                }
                details
            }
            Self::Invalid {
                message,
                child_session_key,
            } => {
                let mut details = serde_json::json!({
                    "status": "error",
                    "error": message,
                });
                if let Some(key) = child_session_key {
                    details["childSessionKey"] = serde_json::Value::String(key.clone());
                }
                details
            }
        }
    }
}

fn normalize_opt(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The orchestration engine root: spawns runs, watches them to completion,
/// and owns the shared collaborator handles.
pub struct SubagentOrchestrator {
    pub(crate) config: Config,
    pub(crate) registry: Arc<RunRegistry>,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) reports: Arc<CompletionReportBook>,
    /// Workspace artifact paths resolve against this.
    pub(crate) workspace: Option<PathBuf>,
    root_cancel: CancellationToken,
}

impl SubagentOrchestrator {
    pub fn new(
        config: Config,
        registry: Arc<RunRegistry>,
        gateway: Arc<dyn Gateway>,
        sessions: Arc<dyn SessionStore>,
        reports: Arc<CompletionReportBook>,
        workspace: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            registry,
            gateway,
            sessions,
            reports,
            workspace,
            root_cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn reports(&self) -> &Arc<CompletionReportBook> {
        &self.reports
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancel a run: fires its cancellation token, which wakes any pending
    /// orchestrator request and the run watcher. Other runs are unaffected.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.registry.cancel_token(run_id) {
            Some(token) => {
                token.cancel();
                info!("Cancelled subagent run {run_id}");
                true
            }
            None => false,
        }
    }

    /// Cancel every live run (process shutdown).
    pub fn cancel_all(&self) {
        self.root_cancel.cancel();
    }

    /// Spawn a subagent run. See the module docs for the step sequence;
    /// every failure path is a typed [`SpawnError`] and leaves the slot
    /// ledger exactly as it found it.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<SpawnAccepted, SpawnError> {
        let label = normalize_opt(&request.label);
        let model_override = normalize_opt(&request.model);
        let thinking_raw = normalize_opt(&request.thinking);

        let requester_key = request.requester_session_key.trim().to_string();
        if requester_key.is_empty() {
            return Err(SpawnError::Invalid {
                message: "requester session key is required".into(),
                child_session_key: None,
            });
        }

        let requester_agent_id = session_key::agent_id_of(&requester_key)
            .map(session_key::normalize_agent_id)
            .unwrap_or_else(|| "main".to_string());
        let target_agent_id = request
            .agent_id
            .as_deref()
            .map(session_key::normalize_agent_id)
            .unwrap_or_else(|| requester_agent_id.clone());

        // 1. Policy: recursion, depth, cross-agent allow-list. No slots are
        // touched and no invoker call is made on a violation.
        if session_key::is_subagent_key(&requester_key) {
            if !self.config.allow_recursive_spawn(&requester_agent_id) {
                return Err(SpawnError::Forbidden {
                    message: "Recursive spawning is not enabled. Set subagents.allowRecursiveSpawn: true in config.".into(),
                });
            }
            let depth = session_key::subagent_depth(&requester_key);
            let max_depth = self.config.max_spawn_depth(&requester_agent_id);
            if depth >= max_depth {
                return Err(SpawnError::Forbidden {
                    message: format!(
                        "Maximum subagent depth ({max_depth}) reached. Cannot spawn deeper."
                    ),
                });
            }
        }

        if target_agent_id != requester_agent_id {
            let allowed = self
                .config
                .allow_agents(&requester_agent_id)
                .unwrap_or(&[]);
            let allow_any = allowed.iter().any(|a| a.trim() == "*");
            let allow_match = allowed
                .iter()
                .any(|a| session_key::normalize_agent_id(a) == target_agent_id);
            if !allow_any && !allow_match {
                let allowed_text = if allowed.is_empty() {
                    "none".to_string()
                } else {
                    allowed.join(", ")
                };
                return Err(SpawnError::Forbidden {
                    message: format!(
                        "agentId \"{target_agent_id}\" is not allowed for spawning (allowed: {allowed_text})"
                    ),
                });
            }
        }

        // Model resolution: explicit override > target agent's subagent
        // default > none.
        let resolved_model =
            model_override.or_else(|| self.config.subagent_model(&target_agent_id));
        let provider_bucket = resolved_model.as_deref().map(|model| {
            split_model_ref(model)
                .0
                .unwrap_or(verdigris_config::UNKNOWN_PROVIDER)
                .to_string()
        });

        // Thinking resolution and validation, before any side effects.
        let thinking_candidate =
            thinking_raw.or_else(|| self.config.subagent_thinking(&target_agent_id));
        let thinking = match thinking_candidate {
            Some(raw) => match ThinkLevel::parse(&raw) {
                Some(level) => Some(level),
                None => {
                    return Err(SpawnError::Invalid {
                        message: format!(
                            "Invalid thinking level \"{raw}\". Use one of: {}.",
                            ThinkLevel::levels_hint()
                        ),
                        child_session_key: None,
                    });
                }
            },
            None => None,
        };

        // 2. Slot reservation. Child slot first, then the provider slot;
        // a provider failure rolls the child slot back before returning.
        let max_children = self.config.max_children_per_agent(&requester_agent_id);
        if !self
            .registry
            .ledger()
            .reserve_child_slot(&requester_key, max_children)
        {
            let active = self.registry.ledger().active_children(&requester_key);
            return Err(SpawnError::Blocked {
                reason: BlockedReason::ParentLimit,
                provider: None,
                active,
                limit: max_children,
                message: format!(
                    "Cannot spawn: {active}/{max_children} children active. Wait for a child to complete."
                ),
            });
        }

        let mut provider_slot: Option<ProviderReservation> = None;
        if let Some(bucket) = &provider_bucket {
            let limit = self.config.provider_limit(bucket);
            match self.registry.ledger().reserve_provider_slot(bucket, limit) {
                Some(reservation) => provider_slot = Some(reservation),
                None => {
                    let active = self.registry.ledger().active_for_provider(bucket);
                    self.registry.ledger().release_child_slot(&requester_key);
                    return Err(SpawnError::Blocked {
                        reason: BlockedReason::ProviderLimit,
                        provider: Some(bucket.clone()),
                        active,
                        limit,
                        message: format!(
                            "Cannot spawn: provider {bucket} is at capacity ({active}/{limit})."
                        ),
                    });
                }
            }
        }

        // Steps 3-7 run with slots held; any failure releases whatever is
        // still reserved before the error propagates.
        let result = self
            .spawn_reserved(
                &request,
                &requester_key,
                &target_agent_id,
                label,
                resolved_model,
                provider_bucket,
                thinking,
                &mut provider_slot,
            )
            .await;

        match result {
            Ok(accepted) => Ok(accepted),
            Err(err) => {
                self.registry.ledger().release_child_slot(&requester_key);
                if let Some(reservation) = provider_slot.take() {
                    self.registry.ledger().release_provider_slot(reservation);
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_reserved(
        self: &Arc<Self>,
        request: &SpawnRequest,
        requester_key: &str,
        target_agent_id: &str,
        label: Option<String>,
        resolved_model: Option<String>,
        provider_bucket: Option<String>,
        thinking: Option<ThinkLevel>,
        provider_slot: &mut Option<ProviderReservation>,
    ) -> Result<SpawnAccepted, SpawnError> {
        // 3. Child session setup. The key is scoped under the requester, and
        // the model patch lands before the invoker call: the invoker reads
        // session state to pick the model.
        let child_session_key = session_key::child_key_for(requester_key, target_agent_id);
        let child_depth = session_key::subagent_depth(requester_key) + 1;

        let mut model_applied = false;
        let mut model_warning = None;
        if let Some(model) = &resolved_model {
            let patch = SessionPatch {
                model: Some(model.clone()),
                ..Default::default()
            };
            match self.sessions.patch_session(&child_session_key, patch).await {
                Ok(()) => model_applied = true,
                Err(e) => {
                    let message = e.to_string();
                    let recoverable = message.contains("invalid model")
                        || message.contains("model not allowed");
                    if !recoverable {
                        return Err(SpawnError::Invalid {
                            message,
                            child_session_key: Some(child_session_key),
                        });
                    }
                    model_warning = Some(message);
                }
            }
        }

        if let Some(level) = thinking {
            let patch = SessionPatch {
                thinking_level: Some(if level == ThinkLevel::Off {
                    None
                } else {
                    Some(level)
                }),
                ..Default::default()
            };
            if let Err(e) = self.sessions.patch_session(&child_session_key, patch).await {
                return Err(SpawnError::Invalid {
                    message: e.to_string(),
                    child_session_key: Some(child_session_key),
                });
            }
        }

        let run_timeout_seconds = request
            .run_timeout_seconds
            .filter(|t| *t > 0)
            .unwrap_or_else(|| self.config.run_timeout_seconds(target_agent_id));

        // 4. Tool overrides travel only in the run invocation, never in a
        // session patch (SessionPatch cannot carry them).
        let extra_system_prompt = build_subagent_system_prompt(
            requester_key,
            &child_session_key,
            label.as_deref(),
            &request.task,
            request.completion_report,
            request.progress_reporting,
        );

        // 6. Invoke.
        let accepted = self
            .gateway
            .start_run(StartRun {
                task: request.task.clone(),
                session_key: child_session_key.clone(),
                label: label.clone(),
                spawned_by: requester_key.to_string(),
                extra_system_prompt,
                thinking,
                tool_overrides: request.tool_overrides.clone(),
                timeout_seconds: (run_timeout_seconds > 0).then_some(run_timeout_seconds),
            })
            .await
            .map_err(|e| SpawnError::Invalid {
                message: e.to_string(),
                child_session_key: Some(child_session_key.clone()),
            })?;
        let run_id = accepted.run_id;

        // 7. Register. From here the registry owns the reservations; they
        // are released when the run retires.
        let cancel = self.root_cancel.child_token();
        self.registry.add_run(
            SubagentRun {
                run_id: run_id.clone(),
                child_session_key: child_session_key.clone(),
                requester_session_key: requester_key.to_string(),
                requester_display_key: requester_key.to_string(),
                task: request.task.clone(),
                label: label.clone(),
                created_at_ms: Utc::now().timestamp_millis(),
                provider: provider_bucket,
                model: resolved_model.clone(),
                cleanup: request.cleanup,
                run_timeout_seconds,
                depth: child_depth,
                verification: request.verification.clone(),
                verification_state: VerificationState::Pending,
                verification_result: None,
                retry_attempted_at_ms: None,
                original_spawn_params: Some(request.clone()),
            },
            RunHandles {
                provider_reservation: provider_slot.take(),
                cancel: cancel.clone(),
            },
        );

        info!(
            "Spawned subagent run {run_id} ({}) for {requester_key}",
            label.as_deref().unwrap_or("unlabeled")
        );

        tokio::spawn(Arc::clone(self).watch_run_boxed(run_id.clone()));

        Ok(SpawnAccepted {
            run_id,
            child_session_key,
            model_applied,
            warning: model_warning,
        })
    }

    /// Boxed so the watch → announce → retry-spawn chain does not create an
    /// infinitely sized future type.
    fn watch_run_boxed(
        self: Arc<Self>,
        run_id: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.watch_run(run_id).await;
        })
    }

    /// Wait for a run to conclude, then hand off to the announce flow.
    async fn watch_run(self: Arc<Self>, run_id: String) {
        let Some(run) = self.registry.get_run(&run_id) else {
            return;
        };
        let cancel = self
            .registry
            .cancel_token(&run_id)
            .unwrap_or_else(CancellationToken::new);
        let wait_bound = Duration::from_secs(run.run_timeout_seconds.max(1)) + WAIT_GRACE;

        let conclusion = tokio::select! {
            _ = cancel.cancelled() => RunConclusion::Cancelled,
            waited = self.gateway.wait_for_run(&run_id, wait_bound) => match waited {
                Ok(wait) => RunConclusion::Finished(wait),
                Err(e) => RunConclusion::WaitFailed(e.to_string()),
            },
        };

        if let Err(e) = self.run_announce_flow(&run_id, conclusion).await {
            warn!("Announce flow failed for run {run_id}: {e}");
            // slots must not leak even when announcing fails
            self.registry.retire_run(&run_id);
        }
    }
}

/// How a watched run ended, as seen by the announce flow.
#[derive(Debug, Clone)]
pub enum RunConclusion {
    Finished(crate::gateway::RunWait),
    Cancelled,
    WaitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagent::testing::{spawn_request, test_orchestrator};

    #[tokio::test]
    async fn accepted_spawn_registers_run() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({}));
        let accepted = orch.spawn(spawn_request("agent:main:main", |_| {})).await.unwrap();

        assert!(!accepted.run_id.is_empty());
        assert!(accepted
            .child_session_key
            .starts_with("agent:main:subagent:"));
        assert!(!accepted.model_applied);

        let runs = orch.registry().list_runs_for_requester("agent:main:main");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, accepted.run_id);
        assert_eq!(gateway.started_runs().len(), 1);
    }

    #[tokio::test]
    async fn cross_agent_spawn_outside_allowlist_is_forbidden() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "list": [
                    { "id": "main", "subagents": { "allowAgents": ["research"] } }
                ]
            }
        }));

        let err = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.agent_id = Some("ops".into());
            }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), "forbidden");
        assert_eq!(err.details()["status"], "forbidden");
        // no invoker call, no slots held
        assert!(gateway.started_runs().is_empty());
        assert_eq!(
            orch.registry().ledger().active_children("agent:main:main"),
            0
        );

        // the allow-listed target works
        let accepted = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.agent_id = Some("research".into());
            }))
            .await
            .unwrap();
        assert!(accepted
            .child_session_key
            .starts_with("agent:research:subagent:"));
    }

    #[tokio::test]
    async fn wildcard_allows_any_target() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "list": [
                    { "id": "main", "subagents": { "allowAgents": ["*"] } }
                ]
            }
        }));
        assert!(orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.agent_id = Some("anything".into());
            }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn recursive_spawn_requires_config_flag() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({}));
        let err = orch
            .spawn(spawn_request("agent:main:subagent:abc", |_| {}))
            .await
            .unwrap_err();
        assert_eq!(err.status(), "forbidden");
        assert!(err.to_string().contains("Recursive spawning"));
        assert!(gateway.started_runs().is_empty());
    }

    #[tokio::test]
    async fn recursive_spawn_bounded_by_depth() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": { "subagents": { "allowRecursiveSpawn": true, "maxSpawnDepth": 2 } }
            }
        }));
        // depth 1 requester can still spawn
        assert!(orch
            .spawn(spawn_request("agent:main:subagent:abc", |_| {}))
            .await
            .is_ok());
        // depth 2 requester is at the cap
        let err = orch
            .spawn(spawn_request("agent:main:subagent:abc:sub:def", |_| {}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[tokio::test]
    async fn parent_limit_blocks_and_holds_no_extra_slots() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": { "subagents": { "maxChildrenPerAgent": 1 } }
            }
        }));
        orch.spawn(spawn_request("agent:main:main", |_| {}))
            .await
            .unwrap();

        let err = orch
            .spawn(spawn_request("agent:main:main", |_| {}))
            .await
            .unwrap_err();
        match &err {
            SpawnError::Blocked { reason, .. } => {
                assert_eq!(*reason, BlockedReason::ParentLimit)
            }
            other => panic!("expected blocked, got {other:?}"),
        }
        assert_eq!(err.details()["reason"], "parent_limit");
        // only the first spawn reached the invoker
        assert_eq!(gateway.started_runs().len(), 1);
        assert_eq!(
            orch.registry().ledger().active_children("agent:main:main"),
            1
        );
    }

    #[tokio::test]
    async fn provider_limit_blocks_with_details_and_rolls_back_child_slot() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": { "providerLimits": { "anthropic": 1 } }
            }
        }));
        orch.spawn(spawn_request("agent:main:main", |r| {
            r.model = Some("anthropic/sonnet".into());
        }))
        .await
        .unwrap();

        let err = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("anthropic/opus".into());
            }))
            .await
            .unwrap_err();
        let details = err.details();
        assert_eq!(details["status"], "blocked");
        assert_eq!(details["reason"], "provider_limit");
        assert_eq!(details["provider"], "anthropic");
        assert_eq!(details["maxConcurrent"], 1);
        assert_eq!(gateway.started_runs().len(), 1);
        // the blocked call's child slot was rolled back
        assert_eq!(
            orch.registry().ledger().active_children("agent:main:main"),
            1
        );
    }

    #[tokio::test]
    async fn bare_model_uses_unknown_provider_bucket() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": { "providerLimits": { "unknown": 1 } }
            }
        }));
        orch.spawn(spawn_request("agent:main:main", |r| {
            r.model = Some("local-model".into());
        }))
        .await
        .unwrap();

        let err = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("other-model".into());
            }))
            .await
            .unwrap_err();
        assert_eq!(err.details()["provider"], "unknown");
    }

    #[tokio::test]
    async fn model_patch_lands_before_invocation_and_sets_model_applied() {
        let (orch, gateway, sessions) = test_orchestrator(serde_json::json!({}));
        let accepted = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("m1".into());
            }))
            .await
            .unwrap();
        assert!(accepted.model_applied);

        let patches = sessions.patches();
        assert_eq!(patches.len(), 1);
        let (key, patch, patched_at) = &patches[0];
        assert_eq!(key, &accepted.child_session_key);
        assert_eq!(patch.model.as_deref(), Some("m1"));
        let started_at = gateway.started_runs()[0].1;
        assert!(patched_at < &started_at, "patch must precede invocation");
    }

    #[tokio::test]
    async fn default_subagent_model_resolves_and_applies() {
        let (orch, _gateway, sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": { "subagents": { "model": "anthropic/haiku" } }
            }
        }));
        let accepted = orch.spawn(spawn_request("agent:main:main", |_| {})).await.unwrap();
        assert!(accepted.model_applied);
        assert_eq!(
            sessions.patches()[0].1.model.as_deref(),
            Some("anthropic/haiku")
        );
        let run = orch.registry().get_run(&accepted.run_id).unwrap();
        assert_eq!(run.provider.as_deref(), Some("anthropic"));
    }

    #[tokio::test]
    async fn tool_overrides_reach_invoker_but_never_session_patches() {
        let (orch, gateway, sessions) = test_orchestrator(serde_json::json!({}));
        orch.spawn(spawn_request("agent:main:main", |r| {
            r.model = Some("m1".into());
            r.tool_overrides = Some(ToolOverrides {
                allow: vec!["read_file".into()],
                deny: vec!["exec".into()],
            });
        }))
        .await
        .unwrap();

        let started = gateway.started_runs();
        let overrides = started[0].0.tool_overrides.clone().unwrap();
        assert_eq!(overrides.allow, vec!["read_file".to_string()]);
        assert_eq!(overrides.deny, vec!["exec".to_string()]);

        for (_, patch, _) in sessions.patches() {
            let json = serde_json::to_value(&patch).unwrap();
            let obj = json.as_object().unwrap();
            for forbidden in ["toolOverrides", "allow", "deny"] {
                assert!(!obj.contains_key(forbidden));
            }
        }
    }

    #[tokio::test]
    async fn invalid_thinking_fails_before_any_side_effect() {
        let (orch, gateway, sessions) = test_orchestrator(serde_json::json!({}));
        let err = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.thinking = Some("galactic".into());
            }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");
        assert!(err.to_string().contains("Invalid thinking level"));
        assert!(gateway.started_runs().is_empty());
        assert!(sessions.patches().is_empty());
        assert_eq!(
            orch.registry().ledger().active_children("agent:main:main"),
            0
        );
    }

    #[tokio::test]
    async fn invoker_failure_releases_every_slot() {
        let (orch, gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": {
                    "subagents": { "maxChildrenPerAgent": 1 },
                    "providerLimits": { "anthropic": 1 }
                }
            }
        }));
        gateway.fail_next_start("invoker unavailable");

        let err = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("anthropic/sonnet".into());
            }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");

        // both slots came back: a spawn up to the original limits succeeds
        let accepted = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("anthropic/sonnet".into());
            }))
            .await
            .unwrap();
        assert!(!accepted.run_id.is_empty());
    }

    #[tokio::test]
    async fn unrecoverable_model_patch_failure_aborts_spawn() {
        let (orch, gateway, sessions) = test_orchestrator(serde_json::json!({}));
        sessions.fail_next_patch("session store offline");
        let err = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("m1".into());
            }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");
        assert!(gateway.started_runs().is_empty());
        assert_eq!(
            orch.registry().ledger().active_children("agent:main:main"),
            0
        );
    }

    #[tokio::test]
    async fn rejected_model_patch_downgrades_to_warning() {
        let (orch, gateway, sessions) = test_orchestrator(serde_json::json!({}));
        sessions.fail_next_patch("invalid model \"m1\"");
        let accepted = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.model = Some("m1".into());
            }))
            .await
            .unwrap();
        assert!(!accepted.model_applied);
        assert!(accepted.warning.unwrap().contains("invalid model"));
        assert_eq!(gateway.started_runs().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_spawns_grant_the_last_slot_once() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({
            "agents": {
                "defaults": { "subagents": { "maxChildrenPerAgent": 1 } }
            }
        }));

        let a = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.spawn(spawn_request("agent:main:main", |_| {})).await })
        };
        let b = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.spawn(spawn_request("agent:main:main", |_| {})).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let granted = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 1, "exactly one spawn wins the last slot");
        let blocked = [a, b].into_iter().find(|r| r.is_err()).unwrap();
        assert_eq!(blocked.unwrap_err().status(), "blocked");
    }

    #[tokio::test]
    async fn run_record_carries_verification_contract_and_original_params() {
        let (orch, _gateway, _sessions) = test_orchestrator(serde_json::json!({}));
        let accepted = orch
            .spawn(spawn_request("agent:main:main", |r| {
                r.verification = Some(crate::subagent::verification::VerificationContract {
                    require_completion_report: true,
                    ..Default::default()
                });
                r.label = Some("scraper".into());
            }))
            .await
            .unwrap();
        let run = orch.registry().get_run(&accepted.run_id).unwrap();
        assert!(run.verification.as_ref().unwrap().require_completion_report);
        let original = run.original_spawn_params.unwrap();
        assert_eq!(original.label.as_deref(), Some("scraper"));
        assert!(original.verification.is_some());
    }
}
