//! Completion reports: the reporting channel a child uses to declare its
//! result, and the parser that extracts a structured report from free text.
//!
//! Verification consults the report book when a contract sets
//! `requireCompletionReport`.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Failed,
}

impl CompletionStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionConfidence {
    High,
    Medium,
    Low,
}

impl CompletionConfidence {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionArtifact {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CompletionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<CompletionConfidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<CompletionArtifact>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl CompletionReport {
    pub fn is_populated(&self) -> bool {
        self.status.is_some()
            || self.confidence.is_some()
            || self.summary.is_some()
            || !self.artifacts.is_empty()
            || !self.blockers.is_empty()
            || !self.warnings.is_empty()
    }
}

fn header_re() -> Regex {
    Regex::new(r"(?i)^\s*(status|confidence|summary|artifacts|blockers|warnings)\s*[:=]\s*(.*?)\s*$")
        .expect("valid header regex")
}

fn fence_re() -> Regex {
    Regex::new(r"^ {0,3}(`{3,}|~{3,})").expect("valid fence regex")
}

/// Blank out fenced code blocks so report headers inside them are ignored.
fn strip_fenced_blocks(input: &str) -> Vec<String> {
    let fence = fence_re();
    let mut open_marker: Option<char> = None;
    let mut out = Vec::new();
    for line in input.lines() {
        if let Some(caps) = fence.captures(line) {
            let marker = caps[1].chars().next().unwrap_or('`');
            match open_marker {
                None => open_marker = Some(marker),
                Some(open) if open == marker => open_marker = None,
                Some(_) => {}
            }
            out.push(String::new());
            continue;
        }
        if open_marker.is_some() {
            out.push(String::new());
        } else {
            out.push(line.to_string());
        }
    }
    out
}

fn strip_list_prefix(line: &str) -> &str {
    let trimmed = line.trim_start();
    for prefix in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return rest;
        }
    }
    // numbered list: "1. item"
    if let Some(dot) = trimmed.find(". ") {
        if trimmed[..dot].chars().all(|c| c.is_ascii_digit()) && dot > 0 {
            return &trimmed[dot + 2..];
        }
    }
    trimmed
}

fn parse_string_lines(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| strip_list_prefix(line.trim()).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn parse_artifact_line(raw: &str) -> Option<CompletionArtifact> {
    let line = strip_list_prefix(raw.trim()).trim();
    if line.is_empty() {
        return None;
    }
    match line.find(" - ") {
        None => Some(CompletionArtifact {
            path: line.to_string(),
            description: None,
        }),
        Some(sep) => {
            let path = line[..sep].trim();
            if path.is_empty() {
                return None;
            }
            let description = line[sep + 3..].trim();
            Some(CompletionArtifact {
                path: path.to_string(),
                description: if description.is_empty() {
                    None
                } else {
                    Some(description.to_string())
                },
            })
        }
    }
}

/// Parse a structured completion report out of a child's report text.
/// Returns None when no recognizable section is present. When a section
/// appears more than once, the last populated occurrence wins.
pub fn parse_completion_report(text: &str) -> Option<CompletionReport> {
    let lines = strip_fenced_blocks(text.trim());
    let header = header_re();
    let mut report = CompletionReport::default();

    let mut i = 0;
    while i < lines.len() {
        let Some(caps) = header.captures(&lines[i]) else {
            i += 1;
            continue;
        };
        let field = caps[1].to_lowercase();
        let inline = caps[2].to_string();

        // An empty inline value means the section body is the following lines
        // up to the next header.
        let section: Vec<String> = if inline.is_empty() {
            let mut body = Vec::new();
            let mut j = i + 1;
            while j < lines.len() && !header.is_match(&lines[j]) {
                body.push(lines[j].clone());
                j += 1;
            }
            body
        } else {
            vec![inline.clone()]
        };

        match field.as_str() {
            "status" => {
                if let Some(status) = CompletionStatus::parse(&inline) {
                    report.status = Some(status);
                }
            }
            "confidence" => {
                if let Some(confidence) = CompletionConfidence::parse(&inline) {
                    report.confidence = Some(confidence);
                }
            }
            "summary" => {
                let cleaned = parse_string_lines(&section);
                if !cleaned.is_empty() {
                    report.summary = Some(cleaned.join(" "));
                }
            }
            "artifacts" => {
                let artifacts: Vec<_> = section
                    .iter()
                    .filter_map(|line| parse_artifact_line(line))
                    .collect();
                if !artifacts.is_empty() {
                    report.artifacts = artifacts;
                }
            }
            "blockers" => {
                let blockers = parse_string_lines(&section);
                if !blockers.is_empty() {
                    report.blockers = blockers;
                }
            }
            "warnings" => {
                let warnings = parse_string_lines(&section);
                if !warnings.is_empty() {
                    report.warnings = warnings;
                }
            }
            _ => {}
        }
        i += 1;
    }

    if report.is_populated() {
        Some(report)
    } else {
        None
    }
}

/// In-process registry of completion reports, keyed by run id. This is the
/// reporting channel the verification step queries.
#[derive(Default)]
pub struct CompletionReportBook {
    reports: Mutex<HashMap<String, CompletionReport>>,
}

impl CompletionReportBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run_id: &str, report: CompletionReport) {
        let mut reports = self.reports.lock().expect("report book poisoned");
        reports.insert(run_id.to_string(), report);
    }

    pub fn report_for_run(&self, run_id: &str) -> Option<CompletionReport> {
        let reports = self.reports.lock().expect("report book poisoned");
        reports.get(run_id).cloned()
    }

    pub fn has_report(&self, run_id: &str) -> bool {
        let reports = self.reports.lock().expect("report book poisoned");
        reports.contains_key(run_id)
    }

    pub fn forget(&self, run_id: &str) {
        let mut reports = self.reports.lock().expect("report book poisoned");
        reports.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inline_fields() {
        let report = parse_completion_report(
            "status: complete\nconfidence: high\nsummary: wrote the thing",
        )
        .unwrap();
        assert_eq!(report.status, Some(CompletionStatus::Complete));
        assert_eq!(report.confidence, Some(CompletionConfidence::High));
        assert_eq!(report.summary.as_deref(), Some("wrote the thing"));
    }

    #[test]
    fn parses_multiline_sections() {
        let text = "status: partial\nblockers:\n- missing API key\n- flaky network\nwarnings:\n* untested path";
        let report = parse_completion_report(text).unwrap();
        assert_eq!(
            report.blockers,
            vec!["missing API key".to_string(), "flaky network".to_string()]
        );
        assert_eq!(report.warnings, vec!["untested path".to_string()]);
    }

    #[test]
    fn parses_artifacts_with_descriptions() {
        let text = "artifacts:\n- out/results.json - scraped entries\n- notes.md";
        let report = parse_completion_report(text).unwrap();
        assert_eq!(report.artifacts.len(), 2);
        assert_eq!(report.artifacts[0].path, "out/results.json");
        assert_eq!(
            report.artifacts[0].description.as_deref(),
            Some("scraped entries")
        );
        assert_eq!(report.artifacts[1].description, None);
    }

    #[test]
    fn ignores_headers_inside_code_fences() {
        let text = "```\nstatus: failed\n```\nstatus: complete";
        let report = parse_completion_report(text).unwrap();
        assert_eq!(report.status, Some(CompletionStatus::Complete));
    }

    #[test]
    fn invalid_status_values_are_skipped() {
        assert!(parse_completion_report("status: maybe").is_none());
    }

    #[test]
    fn last_populated_occurrence_wins() {
        let text = "status: partial\nstatus: complete";
        let report = parse_completion_report(text).unwrap();
        assert_eq!(report.status, Some(CompletionStatus::Complete));
    }

    #[test]
    fn unstructured_text_is_not_a_report() {
        assert!(parse_completion_report("I did the thing, all good.").is_none());
        assert!(parse_completion_report("").is_none());
    }

    #[test]
    fn book_records_and_forgets() {
        let book = CompletionReportBook::new();
        assert!(!book.has_report("run-1"));
        book.record(
            "run-1",
            CompletionReport {
                status: Some(CompletionStatus::Complete),
                ..Default::default()
            },
        );
        assert!(book.has_report("run-1"));
        assert_eq!(
            book.report_for_run("run-1").unwrap().status,
            Some(CompletionStatus::Complete)
        );
        book.forget("run-1");
        assert!(!book.has_report("run-1"));
    }
}
