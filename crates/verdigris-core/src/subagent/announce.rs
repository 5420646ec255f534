//! Verification & announce flow: once a run concludes, check its
//! verification contract, apply the failure policy, deliver a human-readable
//! outcome into the requester's session, and execute the cleanup policy.
//!
//! The flow always produces a terminal announcement: check-execution errors
//! become failed checks, delivery failures are logged, and the run's slots
//! are released up front so a retry spawn can reuse them.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::gateway::{RunStatus, SessionMessage};

use super::registry::{CleanupPolicy, SubagentRun, VerificationState};
use super::spawn::{RunConclusion, SubagentOrchestrator};
use super::verification::{
    run_artifact_checks, FailurePolicy, VerificationCheck, VerificationOutcome,
    VerificationStatus,
};

/// System-prompt augmentation for a spawned child: role, focus rules, and
/// the reporting duties the spawn request asked for.
pub fn build_subagent_system_prompt(
    requester_key: &str,
    child_session_key: &str,
    label: Option<&str>,
    task: &str,
    completion_report: bool,
    progress_reporting: bool,
) -> String {
    let mut prompt = format!(
        "You are a focused background worker agent (subagent).\n\
         Spawned by: {requester_key}\n\
         Your session: {child_session_key}\n"
    );
    if let Some(label) = label {
        prompt.push_str(&format!("Label: {label}\n"));
    }
    prompt.push_str(
        "\nIMPORTANT RULES:\n\
         - Stay focused ONLY on your assigned task\n\
         - Do NOT work on anything besides your task\n\
         - If you are stuck and need guidance, use request_orchestrator; otherwise do not ask questions\n\
         - Be concise but thorough in your work\n\
         - When done, provide a clear summary of what you accomplished\n",
    );
    if completion_report {
        prompt.push_str(
            "\nBefore finishing, call the report_completion tool with a status line \
             (complete/partial/failed), your confidence, and a short summary of what you produced.\n",
        );
    }
    if progress_reporting {
        prompt.push_str(
            "\nReport notable progress as you work so your requester can follow along.\n",
        );
    }
    prompt.push_str(&format!("\nYour task:\n{task}\n"));
    prompt
}

fn display_label(run: &SubagentRun) -> String {
    run.label.clone().unwrap_or_else(|| {
        let short: String = run.run_id.chars().take(8).collect();
        format!("subagent-{short}")
    })
}

fn failing_checks_block(outcome: &VerificationOutcome) -> String {
    outcome
        .failing_reasons()
        .iter()
        .map(|reason| format!("- {reason}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl SubagentOrchestrator {
    /// Evaluate a run's verification contract: artifact checks plus the
    /// completion-report check. Skipped when the run carries no contract.
    pub async fn verify_run(&self, run: &SubagentRun) -> VerificationOutcome {
        let Some(contract) = &run.verification else {
            return VerificationOutcome::skipped();
        };
        let artifact_outcome = run_artifact_checks(contract, self.workspace.as_deref()).await;
        let mut checks = artifact_outcome.checks;
        if contract.require_completion_report {
            checks.push(if self.reports.has_report(&run.run_id) {
                VerificationCheck::completion_report_present()
            } else {
                VerificationCheck::completion_report_missing()
            });
        }
        if checks.is_empty() {
            VerificationOutcome::skipped()
        } else {
            VerificationOutcome::from_checks(checks)
        }
    }

    /// Announce a concluded run to its requester and retire it. Never
    /// panics and never leaves slots held; every path ends in exactly one
    /// delivered (or at least attempted) announcement.
    pub async fn run_announce_flow(
        self: &Arc<Self>,
        run_id: &str,
        conclusion: RunConclusion,
    ) -> Result<()> {
        let Some(run) = self.registry.get_run(run_id) else {
            return Ok(());
        };

        // The run is terminal whichever way it concluded; release its slots
        // first so a retry spawn can take them over.
        self.registry.retire_run(run_id);

        let label = display_label(&run);
        let message = match conclusion {
            RunConclusion::Cancelled => format!(
                "[Subagent '{label}' cancelled] (run {run_id}, status=cancelled)\nTask: {}",
                run.task
            ),
            RunConclusion::WaitFailed(error) => format!(
                "[Subagent '{label}' failed] (run {run_id}, status=failed)\nTask: {}\nError: {error}",
                run.task
            ),
            RunConclusion::Finished(wait) => {
                // A structured report block in the final reply counts as an
                // explicit completion report.
                if let Some(reply) = wait.reply.as_deref() {
                    if !self.reports.has_report(run_id) {
                        if let Some(parsed) = crate::report::parse_completion_report(reply) {
                            self.reports.record(run_id, parsed);
                        }
                    }
                }

                let verification = self.verify_run(&run).await;
                if verification.status != VerificationStatus::Skipped {
                    let state = if verification.status == VerificationStatus::Passed {
                        VerificationState::Passed
                    } else {
                        VerificationState::Failed
                    };
                    let stored = verification.clone();
                    self.registry.update_run(run_id, |r| {
                        r.verification_state = state;
                        r.verification_result = Some(stored);
                    });
                }

                if verification.status == VerificationStatus::Failed {
                    self.announce_verification_failure(&run, &label, &verification)
                        .await
                } else {
                    match wait.status {
                        RunStatus::Completed => {
                            let mut text = format!(
                                "[Subagent '{label}' completed] (run {run_id}, status=completed)\nTask: {}\nResult: {}",
                                run.task,
                                wait.reply.as_deref().unwrap_or("(no final reply)")
                            );
                            if let Some(summary) = self
                                .reports
                                .report_for_run(run_id)
                                .and_then(|report| report.summary)
                            {
                                text.push_str(&format!("\nReport: {summary}"));
                            }
                            text
                        }
                        RunStatus::Failed => format!(
                            "[Subagent '{label}' failed] (run {run_id}, status=failed)\nTask: {}\nError: {}",
                            run.task,
                            wait.reply.as_deref().unwrap_or("run reported failure")
                        ),
                        RunStatus::Timeout => format!(
                            "[Subagent '{label}' timed out] (run {run_id}, status=timeout)\nTask: {}\nTimed out after {}s.",
                            run.task, run.run_timeout_seconds
                        ),
                    }
                }
            }
        };

        if let Err(e) = self
            .gateway
            .post_message(SessionMessage {
                session_key: run.requester_session_key.clone(),
                text: message,
            })
            .await
        {
            warn!("Failed to deliver outcome for run {run_id}: {e}");
        }

        self.reports.forget(run_id);

        match run.cleanup {
            CleanupPolicy::Delete => {
                if let Err(e) = self.sessions.delete_session(&run.child_session_key).await {
                    warn!(
                        "Failed to delete child session {}: {e}",
                        run.child_session_key
                    );
                }
                self.registry.remove_run(run_id);
            }
            CleanupPolicy::Keep => {}
        }

        info!("Announced outcome for run {run_id}");
        Ok(())
    }

    /// Build the announcement for a failed verification, applying the
    /// contract's failure policy (including the single retry spawn).
    async fn announce_verification_failure(
        self: &Arc<Self>,
        run: &SubagentRun,
        label: &str,
        verification: &VerificationOutcome,
    ) -> String {
        let run_id = &run.run_id;
        let checks = failing_checks_block(verification);
        let policy = run
            .verification
            .as_ref()
            .map(|contract| contract.on_failure)
            .unwrap_or_default();

        match policy {
            FailurePolicy::Fail => format!(
                "[Subagent '{label}' failed verification] (run {run_id}, status=verification_failed)\nTask: {}\nFailing checks:\n{checks}",
                run.task
            ),
            FailurePolicy::Escalate => format!(
                "[Subagent '{label}' needs attention] (run {run_id}, status=verification_failed, reason=escalated)\n\
                 Verification failed and requires review before the result is used.\nTask: {}\nFailing checks:\n{checks}",
                run.task
            ),
            FailurePolicy::RetryOnce => {
                if run.retry_attempted_at_ms.is_some() {
                    return format!(
                        "[Subagent '{label}' failed verification] (run {run_id}, status=verification_failed, reason=retry_exhausted)\n\
                         A retry was already attempted; not retrying again.\nTask: {}\nFailing checks:\n{checks}",
                        run.task
                    );
                }
                let Some(params) = run.original_spawn_params.clone() else {
                    return format!(
                        "[Subagent '{label}' failed verification] (run {run_id}, status=verification_failed)\n\
                         Retry requested but the original spawn parameters were not recorded.\nTask: {}\nFailing checks:\n{checks}",
                        run.task
                    );
                };

                let now = Utc::now().timestamp_millis();
                self.registry
                    .update_run(run_id, |r| r.retry_attempted_at_ms = Some(now));

                match self.spawn(params).await {
                    Ok(accepted) => {
                        // the retried attempt must not retry again
                        self.registry.update_run(&accepted.run_id, |r| {
                            r.retry_attempted_at_ms = Some(now);
                        });
                        info!(
                            "Verification retry for run {run_id} started as run {}",
                            accepted.run_id
                        );
                        format!(
                            "[Subagent '{label}' failed verification; retry started] (run {run_id}, retry run {}, status=verification_failed, reason=retrying)\nTask: {}\nFailing checks:\n{checks}",
                            accepted.run_id, run.task
                        )
                    }
                    Err(e) => format!(
                        "[Subagent '{label}' failed verification] (run {run_id}, status=verification_failed, reason=retry_spawn_failed)\n\
                         Retry spawn failed: {e}\nTask: {}\nFailing checks:\n{checks}",
                        run.task
                    ),
                }
            }
        }
    }
}
