//! Request and response bodies of the workflow engine's HTTP API.

use serde::{Deserialize, Serialize};

use crate::documents::PlanDocument;

#[derive(Debug, Clone, Serialize)]
pub struct MessageRequest {
    pub content: String,
    pub user_id: String,
    pub channel_type: String,
    pub channel_id: String,
}

/// The engine's reply to a free-text command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub response_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub timestamp: String,
    pub subject: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub raw_data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KvEntries {
    pub bucket: String,
    #[serde(default)]
    pub entries: Vec<KvEntry>,
}

impl KvEntries {
    pub fn get(&self, key: &str) -> Option<&KvEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KvEntry {
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePlanRequest {
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreatePlanResponse {
    #[serde(default)]
    pub plan: Option<PlanDocument>,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReviewFinding {
    #[serde(default)]
    pub sop_id: String,
    #[serde(default)]
    pub sop_title: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub evidence: String,
}

/// The outcome of asking the engine to promote a plan.
///
/// A reviewer that asks for changes answers with `422`, which is still a valid response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PromotePlanResponse {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub review_verdict: String,
    #[serde(default)]
    pub review_summary: String,
    #[serde(default)]
    pub review_findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(skip)]
    pub http_status: u16,
}

impl PromotePlanResponse {
    /// No reviewer configured counts as approval.
    pub fn is_approved(&self) -> bool {
        self.review_verdict.is_empty() || self.review_verdict == "approved"
    }

    pub fn needs_changes(&self) -> bool {
        self.review_verdict == "needs_changes"
    }

    /// Findings that the reviewer did not let through, as one line each.
    pub fn violations(&self) -> Vec<String> {
        self.review_findings
            .iter()
            .filter(|finding| finding.status != "compliant")
            .map(|finding| format!("{} ({}): {}", finding.sop_id, finding.severity, finding.issue))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerateTasksResponse {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Trajectory {
    #[serde(default)]
    pub loop_id: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub steps: u32,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub model_calls: u32,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub entries: Vec<TrajectoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TrajectoryEntry {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub messages_count: u32,
    #[serde(default)]
    pub response_preview: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::decode;

    #[test]
    fn empty_verdict_is_approval() {
        let response: PromotePlanResponse = decode("promote", r#"{"stage": "approved"}"#).unwrap();

        assert!(response.is_approved());
        assert!(!response.needs_changes());
    }

    #[test]
    fn needs_changes_lists_violations() {
        let response: PromotePlanResponse = decode(
            "promote",
            r#"{
                "review_verdict": "needs_changes",
                "review_summary": "scope is missing",
                "review_findings": [
                    {"sop_id": "sop.scope", "severity": "error", "status": "violation", "issue": "no scope"},
                    {"sop_id": "sop.goal", "severity": "info", "status": "compliant", "issue": ""}
                ]
            }"#,
        )
        .unwrap();

        assert!(response.needs_changes());
        assert!(!response.is_approved());
        assert_eq!(vec!["sop.scope (error): no scope".to_string()], response.violations());
    }

    #[test]
    fn kv_lookup_by_key() {
        let entries: KvEntries = decode(
            "kv entries",
            r#"{"bucket": "WORKFLOWS", "entries": [{"key": "plan.auth", "value": {"phase": "review"}, "revision": 3}]}"#,
        )
        .unwrap();

        assert_eq!(3, entries.get("plan.auth").unwrap().revision);
        assert!(entries.get("plan.other").is_none());
    }
}
