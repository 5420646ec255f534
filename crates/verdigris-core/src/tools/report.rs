//! Tool for a subagent to file its completion report.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::report::{
    CompletionArtifact, CompletionConfidence, CompletionReport, CompletionReportBook,
    CompletionStatus,
};
use crate::tools::{json_result, Tool};

/// `report_completion`: records a structured report for the current run.
/// Verification's completion-report check looks this up by run id.
pub struct ReportCompletionTool {
    reports: Arc<CompletionReportBook>,
    run_id: String,
}

impl ReportCompletionTool {
    pub fn new(reports: Arc<CompletionReportBook>, run_id: &str) -> Self {
        Self {
            reports,
            run_id: run_id.to_string(),
        }
    }
}

fn string_list(params: &serde_json::Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn artifact_list(params: &serde_json::Value) -> Vec<CompletionArtifact> {
    params
        .get("artifacts")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let path = item.get("path")?.as_str()?.trim();
                    if path.is_empty() {
                        return None;
                    }
                    let description = item
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    Some(CompletionArtifact {
                        path: path.to_string(),
                        description,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Tool for ReportCompletionTool {
    fn name(&self) -> &str {
        "report_completion"
    }

    fn description(&self) -> &str {
        "Report completion details, artifacts, and confidence after finishing a subagent task."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "minLength": 1,
                    "description": "What was accomplished"
                },
                "status": {
                    "type": "string",
                    "enum": ["complete", "partial", "failed"]
                },
                "confidence": {
                    "type": "string",
                    "enum": ["high", "medium", "low"]
                },
                "artifacts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string", "minLength": 1},
                            "description": {"type": "string"}
                        },
                        "required": ["path"]
                    }
                },
                "blockers": {"type": "array", "items": {"type": "string"}},
                "warnings": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["summary"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let summary = params
            .get("summary")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: summary"))?;

        let report = CompletionReport {
            status: params
                .get("status")
                .and_then(|v| v.as_str())
                .and_then(CompletionStatus::parse),
            confidence: params
                .get("confidence")
                .and_then(|v| v.as_str())
                .and_then(CompletionConfidence::parse),
            summary: Some(summary.to_string()),
            artifacts: artifact_list(&params),
            blockers: string_list(&params, "blockers"),
            warnings: string_list(&params, "warnings"),
        };

        self.reports.record(&self.run_id, report.clone());
        json_result(&report)
    }
}
