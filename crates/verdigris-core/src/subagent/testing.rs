//! Shared mock collaborators for the orchestration tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use verdigris_config::Config;

use crate::gateway::{Gateway, RunAccepted, RunStatus, RunWait, SessionMessage, StartRun};
use crate::report::CompletionReportBook;
use crate::session::{SessionInfo, SessionPatch, SessionStore};

use super::mediator::OrchestratorMediator;
use super::registry::{CleanupPolicy, RunHandles, RunRegistry, SubagentRun, VerificationState};
use super::spawn::{SpawnRequest, SubagentOrchestrator};

pub(crate) struct MockGateway {
    started: Mutex<Vec<(StartRun, Instant)>>,
    fail_start: Mutex<Option<String>>,
    wait_results: Mutex<HashMap<String, RunWait>>,
    default_wait: Mutex<Option<RunWait>>,
    posts: Mutex<Vec<SessionMessage>>,
    posts_tx: mpsc::UnboundedSender<SessionMessage>,
    posts_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionMessage>>,
    next_run: AtomicU64,
}

impl MockGateway {
    pub(crate) fn new() -> Self {
        let (posts_tx, posts_rx) = mpsc::unbounded_channel();
        Self {
            started: Mutex::new(Vec::new()),
            fail_start: Mutex::new(None),
            wait_results: Mutex::new(HashMap::new()),
            default_wait: Mutex::new(None),
            posts: Mutex::new(Vec::new()),
            posts_tx,
            posts_rx: tokio::sync::Mutex::new(posts_rx),
            next_run: AtomicU64::new(1),
        }
    }

    pub(crate) fn started_runs(&self) -> Vec<(StartRun, Instant)> {
        self.started.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_start(&self, message: &str) {
        *self.fail_start.lock().unwrap() = Some(message.to_string());
    }

    /// Terminal state reported for any run the watcher waits on.
    pub(crate) fn set_wait_result(&self, status: RunStatus, reply: Option<&str>) {
        *self.default_wait.lock().unwrap() = Some(RunWait {
            status,
            reply: reply.map(str::to_string),
        });
    }

    /// Terminal state for one specific run.
    pub(crate) fn complete_run(&self, run_id: &str, status: RunStatus, reply: Option<&str>) {
        self.wait_results.lock().unwrap().insert(
            run_id.to_string(),
            RunWait {
                status,
                reply: reply.map(str::to_string),
            },
        );
    }

    pub(crate) fn posted_messages(&self) -> Vec<SessionMessage> {
        self.posts.lock().unwrap().clone()
    }

    /// Await the next message posted through the gateway.
    pub(crate) async fn wait_for_post(&self) -> SessionMessage {
        let mut rx = self.posts_rx.lock().await;
        rx.recv().await.expect("post channel closed")
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn start_run(&self, params: StartRun) -> Result<RunAccepted> {
        if let Some(message) = self.fail_start.lock().unwrap().take() {
            bail!(message);
        }
        self.started.lock().unwrap().push((params, Instant::now()));
        let n = self.next_run.fetch_add(1, Ordering::SeqCst);
        Ok(RunAccepted {
            run_id: format!("run-{n}"),
        })
    }

    async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<RunWait> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(wait) = self.wait_results.lock().unwrap().remove(run_id) {
                return Ok(wait);
            }
            if let Some(wait) = self.default_wait.lock().unwrap().clone() {
                return Ok(wait);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(RunWait {
                    status: RunStatus::Timeout,
                    reply: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn post_message(&self, message: SessionMessage) -> Result<()> {
        self.posts.lock().unwrap().push(message.clone());
        let _ = self.posts_tx.send(message);
        Ok(())
    }
}

pub(crate) struct MemorySessions {
    patches: Mutex<Vec<(String, SessionPatch, Instant)>>,
    deleted: Mutex<Vec<String>>,
    active: Mutex<Vec<String>>,
    fail_patch: Mutex<Option<String>>,
}

impl MemorySessions {
    pub(crate) fn new() -> Self {
        Self {
            patches: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            fail_patch: Mutex::new(None),
        }
    }

    pub(crate) fn patches(&self) -> Vec<(String, SessionPatch, Instant)> {
        self.patches.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn set_active(&self, keys: &[&str]) {
        *self.active.lock().unwrap() = keys.iter().map(|k| k.to_string()).collect();
    }

    pub(crate) fn fail_next_patch(&self, message: &str) {
        *self.fail_patch.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn patch_session(&self, key: &str, patch: SessionPatch) -> Result<()> {
        if let Some(message) = self.fail_patch.lock().unwrap().take() {
            bail!(message);
        }
        self.patches
            .lock()
            .unwrap()
            .push((key.to_string(), patch, Instant::now()));
        Ok(())
    }

    async fn delete_session(&self, key: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>> {
        Ok(self
            .active
            .lock()
            .unwrap()
            .iter()
            .map(|key| SessionInfo {
                key: key.clone(),
                updated_at_ms: Utc::now().timestamp_millis(),
            })
            .collect())
    }
}

pub(crate) fn test_orchestrator(
    config_json: serde_json::Value,
) -> (
    Arc<SubagentOrchestrator>,
    Arc<MockGateway>,
    Arc<MemorySessions>,
) {
    test_orchestrator_with(config_json, None)
}

pub(crate) fn test_orchestrator_with(
    config_json: serde_json::Value,
    workspace: Option<PathBuf>,
) -> (
    Arc<SubagentOrchestrator>,
    Arc<MockGateway>,
    Arc<MemorySessions>,
) {
    let config: Config = serde_json::from_value(config_json).unwrap();
    let registry = Arc::new(RunRegistry::in_memory());
    let gateway = Arc::new(MockGateway::new());
    let sessions = Arc::new(MemorySessions::new());
    let reports = Arc::new(CompletionReportBook::new());
    let orchestrator = Arc::new(SubagentOrchestrator::new(
        config,
        registry,
        gateway.clone(),
        sessions.clone(),
        reports,
        workspace,
    ));
    (orchestrator, gateway, sessions)
}

pub(crate) fn test_world() -> (
    Arc<OrchestratorMediator>,
    Arc<RunRegistry>,
    Arc<MockGateway>,
    Arc<MemorySessions>,
) {
    let registry = Arc::new(RunRegistry::in_memory());
    let gateway = Arc::new(MockGateway::new());
    let sessions = Arc::new(MemorySessions::new());
    let mediator = Arc::new(OrchestratorMediator::new(
        registry.clone(),
        sessions.clone(),
        gateway.clone(),
        verdigris_config::OrchestratorConfig::default(),
    ));
    (mediator, registry, gateway, sessions)
}

/// Register a run record directly, bypassing the spawn path.
pub(crate) fn register_run(
    registry: &Arc<RunRegistry>,
    run_id: &str,
    child_session_key: &str,
    requester_session_key: &str,
    run_timeout_seconds: u64,
) -> CancellationToken {
    let token = CancellationToken::new();
    registry.add_run(
        SubagentRun {
            run_id: run_id.into(),
            child_session_key: child_session_key.into(),
            requester_session_key: requester_session_key.into(),
            requester_display_key: requester_session_key.into(),
            task: "delegated task".into(),
            label: None,
            created_at_ms: Utc::now().timestamp_millis(),
            provider: None,
            model: None,
            cleanup: CleanupPolicy::Keep,
            run_timeout_seconds,
            depth: 1,
            verification: None,
            verification_state: VerificationState::Pending,
            verification_result: None,
            retry_attempted_at_ms: None,
            original_spawn_params: None,
        },
        RunHandles {
            provider_reservation: None,
            cancel: token.clone(),
        },
    );
    token
}

pub(crate) fn spawn_request(
    requester: &str,
    customize: impl FnOnce(&mut SpawnRequest),
) -> SpawnRequest {
    let mut request = SpawnRequest {
        task: "do a thing".into(),
        requester_session_key: requester.into(),
        label: None,
        agent_id: None,
        model: None,
        thinking: None,
        run_timeout_seconds: Some(600),
        completion_report: false,
        progress_reporting: false,
        cleanup: CleanupPolicy::Keep,
        tool_overrides: None,
        verification: None,
    };
    customize(&mut request);
    request
}
