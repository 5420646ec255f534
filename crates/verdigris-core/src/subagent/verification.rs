//! Verification contracts and artifact checks.
//!
//! A spawn may attach a contract describing the files the child is expected
//! to produce and whether it must file a completion report. Checks run once
//! the run's outcome is known, bounded by the contract's timeout, and a
//! check that cannot execute (unreadable file, timeout) fails with a reason
//! instead of erroring out of the announce flow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VERIFICATION_TIMEOUT_MS: u64 = 30_000;

const TIMEOUT_TARGET: &str = "<verification>";
const TIMEOUT_REASON: &str = "verification_timeout";

/// One expected output file and its structural checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationArtifact {
    /// Path to the expected file, relative to the workspace or absolute.
    pub path: String,
    /// Require the file to parse as JSON.
    pub json: bool,
    /// Require a top-level JSON array with at least this many entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    /// Keys required on a top-level object, or on every element of a
    /// top-level array.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_keys: Option<Vec<String>>,
    /// Minimum file size in bytes (catches empty/stub files).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    RetryOnce,
    Escalate,
    #[default]
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationContract {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<VerificationArtifact>,
    pub require_completion_report: bool,
    pub on_failure: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_timeout_ms: Option<u64>,
}

impl VerificationContract {
    pub fn timeout(&self) -> Duration {
        let ms = match self.verification_timeout_ms {
            Some(ms) if ms > 0 => ms,
            _ => DEFAULT_VERIFICATION_TIMEOUT_MS,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Artifact,
    CompletionReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCheck {
    #[serde(rename = "type")]
    pub kind: CheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationCheck {
    pub fn artifact_pass(target: &str) -> Self {
        Self {
            kind: CheckKind::Artifact,
            target: Some(target.to_string()),
            passed: true,
            reason: None,
        }
    }

    pub fn artifact_fail(target: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: CheckKind::Artifact,
            target: Some(target.to_string()),
            passed: false,
            reason: Some(reason.into()),
        }
    }

    pub fn completion_report_missing() -> Self {
        Self {
            kind: CheckKind::CompletionReport,
            target: None,
            passed: false,
            reason: Some("completion_report_missing".into()),
        }
    }

    pub fn completion_report_present() -> Self {
        Self {
            kind: CheckKind::CompletionReport,
            target: None,
            passed: true,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub status: VerificationStatus,
    pub checks: Vec<VerificationCheck>,
    pub verified_at_ms: i64,
}

impl VerificationOutcome {
    pub(crate) fn from_checks(checks: Vec<VerificationCheck>) -> Self {
        let status = if checks.iter().all(|c| c.passed) {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };
        Self {
            status,
            checks,
            verified_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: VerificationStatus::Skipped,
            checks: Vec::new(),
            verified_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn failing_reasons(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| match (&c.target, &c.reason) {
                (Some(target), Some(reason)) => format!("{target}: {reason}"),
                (None, Some(reason)) => reason.clone(),
                (Some(target), None) => target.clone(),
                (None, None) => "unspecified".to_string(),
            })
            .collect()
    }
}

fn resolve_artifact_path(workspace_dir: Option<&Path>, artifact_path: &str) -> PathBuf {
    let path = Path::new(artifact_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir
            .map(|dir| dir.join(path))
            .unwrap_or_else(|| path.to_path_buf())
    }
}

async fn check_artifact(
    artifact: &VerificationArtifact,
    workspace_dir: Option<&Path>,
) -> VerificationCheck {
    let trimmed = artifact.path.trim();
    if trimmed.is_empty() {
        return VerificationCheck::artifact_fail("", "artifact_path_empty");
    }

    let target = resolve_artifact_path(workspace_dir, trimmed);
    let display = target.display().to_string();

    let meta = match tokio::fs::metadata(&target).await {
        Ok(meta) => meta,
        Err(_) => return VerificationCheck::artifact_fail(&display, "artifact_not_found"),
    };
    if !meta.is_file() {
        return VerificationCheck::artifact_fail(&display, "artifact_not_file");
    }
    if let Some(min_bytes) = artifact.min_bytes {
        if meta.len() < min_bytes {
            return VerificationCheck::artifact_fail(
                &display,
                format!("artifact_too_small ({} < {} bytes)", meta.len(), min_bytes),
            );
        }
    }

    if !artifact.json && artifact.min_items.is_none() && artifact.required_keys.is_none() {
        return VerificationCheck::artifact_pass(&display);
    }

    let raw = match tokio::fs::read_to_string(&target).await {
        Ok(raw) => raw,
        Err(_) => return VerificationCheck::artifact_fail(&display, "artifact_unreadable"),
    };
    let parsed: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(_) => return VerificationCheck::artifact_fail(&display, "artifact_json_parse_failed"),
    };

    if let Some(min_items) = artifact.min_items {
        let Some(items) = parsed.as_array() else {
            return VerificationCheck::artifact_fail(&display, "artifact_json_not_array");
        };
        if (items.len() as u64) < min_items {
            return VerificationCheck::artifact_fail(
                &display,
                format!("artifact_json_too_few_items ({} < {min_items})", items.len()),
            );
        }
    }

    if let Some(required_keys) = &artifact.required_keys {
        let keys: Vec<&str> = required_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();
        match &parsed {
            serde_json::Value::Object(obj) => {
                for key in &keys {
                    if !obj.contains_key(*key) {
                        return VerificationCheck::artifact_fail(
                            &display,
                            format!("artifact_json_missing_required_key_{key}"),
                        );
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let Some(obj) = item.as_object() else {
                        return VerificationCheck::artifact_fail(
                            &display,
                            format!("artifact_json_item_not_object_{index}"),
                        );
                    };
                    for key in &keys {
                        if !obj.contains_key(*key) {
                            return VerificationCheck::artifact_fail(
                                &display,
                                format!("artifact_json_item_missing_required_key_{index}.{key}"),
                            );
                        }
                    }
                }
            }
            _ => {
                return VerificationCheck::artifact_fail(&display, "artifact_json_not_object");
            }
        }
    }

    VerificationCheck::artifact_pass(&display)
}

/// Run the contract's artifact checks. Skipped when the contract lists no
/// artifacts. The whole pass is bounded by the contract timeout; a timeout
/// is a failed check, not an error.
pub async fn run_artifact_checks(
    contract: &VerificationContract,
    workspace_dir: Option<&Path>,
) -> VerificationOutcome {
    if contract.artifacts.is_empty() {
        return VerificationOutcome::skipped();
    }

    let pass = async {
        let mut checks = Vec::with_capacity(contract.artifacts.len());
        for artifact in &contract.artifacts {
            checks.push(check_artifact(artifact, workspace_dir).await);
        }
        checks
    };

    match tokio::time::timeout(contract.timeout(), pass).await {
        Ok(checks) => VerificationOutcome::from_checks(checks),
        Err(_) => VerificationOutcome::from_checks(vec![VerificationCheck::artifact_fail(
            TIMEOUT_TARGET,
            TIMEOUT_REASON,
        )]),
    }
}
