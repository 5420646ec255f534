//! Orchestrator request mediator: lets a running child put a blocking
//! question to its parent and resume when the parent answers, the wait
//! elapses, or the run is cancelled.
//!
//! The wait is a three-way `tokio::select!` race (resolution channel, timer,
//! cancellation token); whichever arm wins decides the terminal status and
//! the losers are dropped with it. Suspending here never blocks other runs,
//! other requests, or the parent's own traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use verdigris_config::OrchestratorConfig;

use crate::gateway::{Gateway, SessionMessage};
use crate::session::SessionStore;
use crate::session_key;

use super::registry::RunRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    #[default]
    Normal,
    High,
}

impl RequestPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Resolved,
    Timeout,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A pending child→parent question.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorRequest {
    pub request_id: String,
    pub child_session_key: String,
    pub parent_session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub priority: RequestPriority,
    pub created_at_ms: i64,
    pub timeout_at_ms: i64,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pub message: String,
    pub context: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub priority: RequestPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcomeStatus {
    Resolved,
    Timeout,
    Cancelled,
    ParentUnavailable,
    Error,
}

impl RequestOutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ParentUnavailable => "parent_unavailable",
            Self::Error => "error",
        }
    }
}

/// Terminal result of a child's `request` call. Always returned, never
/// thrown: the child's tool invocation renders it either way.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    pub status: RequestOutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestOutcome {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: RequestOutcomeStatus::Error,
            request_id: None,
            response: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RespondStatus {
    Ok,
    NotFound,
    AlreadyResolved,
    Forbidden,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondOutcome {
    pub status: RespondStatus,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PendingEntry {
    record: OrchestratorRequest,
    resolver: Option<oneshot::Sender<String>>,
}

pub struct OrchestratorMediator {
    registry: Arc<RunRegistry>,
    sessions: Arc<dyn SessionStore>,
    gateway: Arc<dyn Gateway>,
    policy: OrchestratorConfig,
    requests: Mutex<HashMap<String, PendingEntry>>,
}

impl OrchestratorMediator {
    pub fn new(
        registry: Arc<RunRegistry>,
        sessions: Arc<dyn SessionStore>,
        gateway: Arc<dyn Gateway>,
        policy: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            gateway,
            policy,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_request(&self, request_id: &str) -> Option<OrchestratorRequest> {
        let requests = self.requests.lock().expect("request map poisoned");
        requests.get(request_id).map(|e| e.record.clone())
    }

    pub fn pending_count_for_child(&self, child_session_key: &str) -> usize {
        let requests = self.requests.lock().expect("request map poisoned");
        requests
            .values()
            .filter(|e| {
                e.record.child_session_key == child_session_key
                    && e.record.status == RequestStatus::Pending
            })
            .count()
    }

    /// Send a blocking request to the parent and wait for resolution,
    /// timeout, or cancellation of the owning run.
    pub async fn request(
        &self,
        child_session_key: &str,
        params: RequestParams,
    ) -> RequestOutcome {
        let child_session_key = child_session_key.trim();

        // 1. Only delegated runs may call this.
        if !session_key::is_subagent_key(child_session_key) {
            return RequestOutcome::error(
                "request_orchestrator is only available to subagent sessions.",
            );
        }

        // 2. Resolve the parent through the run registry.
        let Some(run) = self.registry.get_run_by_child_key(child_session_key) else {
            return RequestOutcome::error(
                "Could not resolve parent session. No run record found.",
            );
        };
        let parent_session_key = run.requester_session_key.clone();

        // 3. Best-effort liveness check; an unreadable session list counts
        // as available.
        let parent_available = match self.sessions.list_active_sessions().await {
            Ok(sessions) => sessions.iter().any(|s| s.key == parent_session_key),
            Err(_) => true,
        };
        if !parent_available {
            return RequestOutcome {
                status: RequestOutcomeStatus::ParentUnavailable,
                request_id: None,
                response: None,
                error: Some("Parent session is not active.".into()),
            };
        }

        // 4. Timeout budgeting: the requested wait is clamped to policy
        // bounds, then to the run's remaining budget minus the safety
        // buffer. A request that cannot resolve in time is never created.
        let requested = Duration::from_secs(
            params
                .timeout_seconds
                .unwrap_or(self.policy.default_wait_secs)
                .max(self.policy.min_wait_secs)
                .min(self.policy.max_wait_secs),
        );
        let mut effective = requested;
        if run.run_timeout_seconds > 0 {
            let elapsed_ms = (Utc::now().timestamp_millis() - run.created_at_ms).max(0) as u64;
            let total_ms = run.run_timeout_seconds * 1000;
            let buffer_ms = self.policy.safety_buffer_secs * 1000;
            let remaining_ms = total_ms.saturating_sub(elapsed_ms);
            if remaining_ms <= buffer_ms {
                return RequestOutcome {
                    status: RequestOutcomeStatus::Timeout,
                    request_id: None,
                    response: None,
                    error: Some(
                        "Insufficient remaining run time for orchestrator request.".into(),
                    ),
                };
            }
            effective = effective.min(Duration::from_millis(remaining_ms - buffer_ms));
        }

        // 5. Create the record, enforcing the per-child pending cap.
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<String>();
        {
            let mut requests = self.requests.lock().expect("request map poisoned");
            let pending = requests
                .values()
                .filter(|e| {
                    e.record.child_session_key == child_session_key
                        && e.record.status == RequestStatus::Pending
                })
                .count();
            if pending >= self.policy.max_pending_per_child as usize {
                return RequestOutcome::error(format!(
                    "Max pending requests ({}) reached for child",
                    self.policy.max_pending_per_child
                ));
            }
            let now = Utc::now().timestamp_millis();
            requests.insert(
                request_id.clone(),
                PendingEntry {
                    record: OrchestratorRequest {
                        request_id: request_id.clone(),
                        child_session_key: child_session_key.to_string(),
                        parent_session_key: parent_session_key.clone(),
                        run_id: Some(run.run_id.clone()),
                        message: params.message.clone(),
                        context: params.context.clone(),
                        priority: params.priority,
                        created_at_ms: now,
                        timeout_at_ms: now + effective.as_millis() as i64,
                        status: RequestStatus::Pending,
                        response: None,
                        resolved_at_ms: None,
                    },
                    resolver: Some(tx),
                },
            );
        }

        // 6. Best-effort parent notification; the request outlives a failed
        // delivery and can still resolve or time out.
        let notification = self.notification_text(
            &request_id,
            child_session_key,
            run.label.as_deref(),
            &params,
            effective,
        );
        if let Err(e) = self
            .gateway
            .post_message(SessionMessage {
                session_key: parent_session_key.clone(),
                text: notification,
            })
            .await
        {
            debug!("Orchestrator request notification delivery failed: {e}");
        }

        // 7. Race resolution against the timer and the run's cancellation.
        let cancel = self
            .registry
            .cancel_token(&run.run_id)
            .unwrap_or_else(CancellationToken::new);

        tokio::select! {
            resolved = rx => match resolved {
                Ok(response) => RequestOutcome {
                    status: RequestOutcomeStatus::Resolved,
                    request_id: Some(request_id),
                    response: Some(response),
                    error: None,
                },
                Err(_) => self.conclude(&request_id, RequestStatus::Cancelled),
            },
            _ = tokio::time::sleep(effective) => self.conclude(&request_id, RequestStatus::Timeout),
            _ = cancel.cancelled() => self.conclude(&request_id, RequestStatus::Cancelled),
        }
    }

    /// Mark a request terminal after its timer or cancellation arm won the
    /// race. A response that slipped in first still counts as resolved.
    fn conclude(&self, request_id: &str, status: RequestStatus) -> RequestOutcome {
        let mut requests = self.requests.lock().expect("request map poisoned");
        let Some(entry) = requests.get_mut(request_id) else {
            return RequestOutcome::error(format!("Request not found: {request_id}"));
        };
        if entry.record.status == RequestStatus::Resolved {
            return RequestOutcome {
                status: RequestOutcomeStatus::Resolved,
                request_id: Some(request_id.to_string()),
                response: entry.record.response.clone(),
                error: None,
            };
        }
        entry.resolver = None;
        entry.record.status = status;
        entry.record.resolved_at_ms = Some(Utc::now().timestamp_millis());
        let (outcome_status, error) = match status {
            RequestStatus::Timeout => (
                RequestOutcomeStatus::Timeout,
                "Orchestrator request timed out without a response.",
            ),
            _ => (
                RequestOutcomeStatus::Cancelled,
                "Run was cancelled while the request was pending.",
            ),
        };
        RequestOutcome {
            status: outcome_status,
            request_id: Some(request_id.to_string()),
            response: None,
            error: Some(error.to_string()),
        }
    }

    /// Parent-side resolution of a pending request by id.
    pub fn respond(
        &self,
        request_id: &str,
        response: &str,
        caller_session_key: &str,
    ) -> RespondOutcome {
        let mut requests = self.requests.lock().expect("request map poisoned");
        let Some(entry) = requests.get_mut(request_id) else {
            return RespondOutcome {
                status: RespondStatus::NotFound,
                request_id: request_id.to_string(),
                error: Some(format!("Request not found: {request_id}")),
            };
        };

        if entry.record.status.is_terminal() {
            return RespondOutcome {
                status: RespondStatus::AlreadyResolved,
                request_id: request_id.to_string(),
                error: Some(format!(
                    "Request {request_id} is already {}",
                    entry.record.status.as_str()
                )),
            };
        }

        let caller = caller_session_key.trim();
        if !caller.is_empty() && entry.record.parent_session_key != caller {
            return RespondOutcome {
                status: RespondStatus::Forbidden,
                request_id: request_id.to_string(),
                error: Some("Only the designated parent can respond to this request.".into()),
            };
        }

        entry.record.status = RequestStatus::Resolved;
        entry.record.response = Some(response.to_string());
        entry.record.resolved_at_ms = Some(Utc::now().timestamp_millis());
        if let Some(tx) = entry.resolver.take() {
            // the waiter may have just concluded; losing this race is fine
            let _ = tx.send(response.to_string());
        }
        RespondOutcome {
            status: RespondStatus::Ok,
            request_id: request_id.to_string(),
            error: None,
        }
    }

    fn notification_text(
        &self,
        request_id: &str,
        child_session_key: &str,
        label: Option<&str>,
        params: &RequestParams,
        effective: Duration,
    ) -> String {
        let mut lines = vec![
            format!("[subagent_request requestId={request_id}]"),
            format!("From: {child_session_key}"),
        ];
        if let Some(label) = label {
            lines.push(format!("Label: \"{label}\""));
        }
        lines.push(format!("Priority: {}", params.priority.as_str()));
        lines.push(format!("Timeout: {}s", effective.as_secs()));
        lines.push(String::new());
        lines.push(format!("Question: {}", params.message));
        if let Some(context) = &params.context {
            lines.push(format!("Context: {context}"));
        }
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(format!(
            "Respond: respond_orchestrator_request(requestId=\"{request_id}\", response=\"your guidance\")"
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagent::testing::{register_run, test_world};

    fn params(message: &str) -> RequestParams {
        RequestParams {
            message: message.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_non_subagent_callers() {
        let (mediator, _registry, _gateway, _sessions) = test_world();
        let outcome = mediator.request("agent:main:main", params("help")).await;
        assert_eq!(outcome.status, RequestOutcomeStatus::Error);
        assert!(outcome.error.unwrap().contains("only available to subagent"));
    }

    #[tokio::test]
    async fn rejects_unknown_child_sessions() {
        let (mediator, _registry, _gateway, _sessions) = test_world();
        let outcome = mediator
            .request("agent:main:subagent:ghost", params("help"))
            .await;
        assert_eq!(outcome.status, RequestOutcomeStatus::Error);
        assert!(outcome.error.unwrap().contains("Could not resolve parent"));
    }

    #[tokio::test]
    async fn fails_fast_when_parent_is_not_active() {
        let (mediator, registry, _gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:other:main"]);

        let outcome = mediator
            .request("agent:main:subagent:a", params("help"))
            .await;
        assert_eq!(outcome.status, RequestOutcomeStatus::ParentUnavailable);
    }

    #[tokio::test]
    async fn insufficient_run_budget_times_out_without_delivery() {
        let (mediator, registry, gateway, sessions) = test_world();
        // 20s total budget < 30s safety buffer
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 20);
        sessions.set_active(&["agent:main:main"]);

        let outcome = mediator
            .request("agent:main:subagent:a", params("help"))
            .await;
        assert_eq!(outcome.status, RequestOutcomeStatus::Timeout);
        assert!(outcome.error.unwrap().contains("Insufficient remaining run time"));
        assert!(outcome.request_id.is_none());
        assert!(gateway.posted_messages().is_empty());
    }

    #[tokio::test]
    async fn resolved_by_parent_response() {
        let (mediator, registry, gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let waiter = {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                mediator
                    .request("agent:main:subagent:a", params("which branch?"))
                    .await
            })
        };

        // wait for the notification so the request id is known
        let notification = gateway.wait_for_post().await;
        assert!(notification.text.contains("Question: which branch?"));
        assert_eq!(notification.session_key, "agent:main:main");
        let request_id = notification
            .text
            .lines()
            .next()
            .unwrap()
            .trim_start_matches("[subagent_request requestId=")
            .trim_end_matches(']')
            .to_string();

        let respond = mediator.respond(&request_id, "use main", "agent:main:main");
        assert_eq!(respond.status, RespondStatus::Ok);

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.status, RequestOutcomeStatus::Resolved);
        assert_eq!(outcome.response.as_deref(), Some("use main"));
        assert_eq!(
            mediator.get_request(&request_id).unwrap().status,
            RequestStatus::Resolved
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (mediator, registry, _gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let outcome = mediator
            .request(
                "agent:main:subagent:a",
                RequestParams {
                    message: "anyone there?".into(),
                    timeout_seconds: Some(10),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(outcome.status, RequestOutcomeStatus::Timeout);
        let request_id = outcome.request_id.unwrap();
        assert_eq!(
            mediator.get_request(&request_id).unwrap().status,
            RequestStatus::Timeout
        );

        // answering afterwards reports already_resolved
        let respond = mediator.respond(&request_id, "too late", "agent:main:main");
        assert_eq!(respond.status, RespondStatus::AlreadyResolved);
    }

    #[tokio::test]
    async fn run_cancellation_wakes_the_wait() {
        let (mediator, registry, _gateway, sessions) = test_world();
        let cancel = register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let waiter = {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                mediator
                    .request("agent:main:subagent:a", params("still there?"))
                    .await
            })
        };
        // let the request reach its pending state
        while mediator.pending_count_for_child("agent:main:subagent:a") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.status, RequestOutcomeStatus::Cancelled);
    }

    #[tokio::test]
    async fn pending_cap_rejects_the_fourth_request() {
        let (mediator, registry, _gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let mut waiters = Vec::new();
        for i in 0..3 {
            let mediator = mediator.clone();
            waiters.push(tokio::spawn(async move {
                mediator
                    .request("agent:main:subagent:a", params(&format!("q{i}")))
                    .await
            }));
        }
        while mediator.pending_count_for_child("agent:main:subagent:a") < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = mediator
            .request("agent:main:subagent:a", params("one too many"))
            .await;
        assert_eq!(outcome.status, RequestOutcomeStatus::Error);
        assert!(outcome.error.unwrap().contains("Max pending requests"));

        for waiter in waiters {
            waiter.abort();
        }
    }

    #[tokio::test]
    async fn requests_resolve_independently_in_any_order() {
        let (mediator, registry, gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        register_run(&registry, "r2", "agent:main:subagent:b", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let first = {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                mediator.request("agent:main:subagent:a", params("first")).await
            })
        };
        let first_note = gateway.wait_for_post().await;
        let second = {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                mediator.request("agent:main:subagent:b", params("second")).await
            })
        };
        let second_note = gateway.wait_for_post().await;

        let id_of = |text: &str| {
            text.lines()
                .next()
                .unwrap()
                .trim_start_matches("[subagent_request requestId=")
                .trim_end_matches(']')
                .to_string()
        };

        // resolve the second request first
        mediator.respond(&id_of(&second_note.text), "answer-2", "agent:main:main");
        let outcome2 = second.await.unwrap();
        assert_eq!(outcome2.response.as_deref(), Some("answer-2"));

        mediator.respond(&id_of(&first_note.text), "answer-1", "agent:main:main");
        let outcome1 = first.await.unwrap();
        assert_eq!(outcome1.response.as_deref(), Some("answer-1"));
    }

    #[tokio::test]
    async fn respond_authorization_and_not_found() {
        let (mediator, registry, gateway, sessions) = test_world();
        register_run(&registry, "r1", "agent:main:subagent:a", "agent:main:main", 0);
        sessions.set_active(&["agent:main:main"]);

        let waiter = {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                mediator.request("agent:main:subagent:a", params("q")).await
            })
        };
        let note = gateway.wait_for_post().await;
        let request_id = note
            .text
            .lines()
            .next()
            .unwrap()
            .trim_start_matches("[subagent_request requestId=")
            .trim_end_matches(']')
            .to_string();

        let respond = mediator.respond(&request_id, "nope", "agent:intruder:main");
        assert_eq!(respond.status, RespondStatus::Forbidden);

        let respond = mediator.respond("no-such-id", "hello", "agent:main:main");
        assert_eq!(respond.status, RespondStatus::NotFound);

        mediator.respond(&request_id, "real answer", "agent:main:main");
        assert_eq!(
            waiter.await.unwrap().response.as_deref(),
            Some("real answer")
        );
    }
}
