//! Shared records for the analysis pipeline
//!
//! The queue envelope (`AnalysisJob`), the persisted request record
//! (`AnalysisRequest`), and the finding rows the report UI renders. Requests
//! and findings are append-only once they reach a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of scan a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PrScan,
    FullScan,
}

/// Pull-request metadata carried by a `pr_scan` ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMetadata {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    pub base_branch: String,
    pub head_branch: String,
}

/// Where to fetch the sources from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub url: String,
    /// Branch for full scans; head branch for PR scans.
    pub branch: String,
    /// Pin to an exact commit instead of branch HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrMetadata>,
}

/// Which completion backend serves a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    HostedA,
    HostedB,
}

/// Per-job LLM configuration; unset fields fall back to process defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Per-project key override; never written back to process config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            model: None,
            temperature: None,
            api_key: None,
        }
    }
}

/// The queue envelope. Serialized as JSON on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub project_id: String,
    pub repo_ref: RepoRef,
    pub requested_at: DateTime<Utc>,
    #[serde(default = "default_output_language")]
    pub output_language: String,
    #[serde(default)]
    pub llm_config: LlmProviderConfig,
    #[serde(default)]
    pub project_notes: String,
    /// Named prompt template to use instead of the kind's default; the
    /// specialty templates (security, performance, lifecycle, code review)
    /// are selected this way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_template: Option<String>,
}

fn default_output_language() -> String {
    "English".to_string()
}

impl AnalysisJob {
    pub fn new(kind: JobKind, project_id: impl Into<String>, repo_ref: RepoRef) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            kind,
            project_id: project_id.into(),
            repo_ref,
            requested_at: Utc::now(),
            output_language: default_output_language(),
            llm_config: LlmProviderConfig::default(),
            project_notes: String::new(),
            analysis_template: None,
        }
    }

    pub fn with_llm_config(mut self, llm_config: LlmProviderConfig) -> Self {
        self.llm_config = llm_config;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.project_notes = notes.into();
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.analysis_template = Some(template.into());
        self
    }
}

/// Lifecycle of a persisted analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    SourceFetched,
    CkgBuilding,
    Analyzing,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// Persisted record mirroring an `AnalysisJob`, advanced by the worker before
/// each step's external I/O so a restart can observe progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub project_id: String,
    pub status: RequestStatus,
    /// Graph snapshot this request was analyzed against.
    pub project_graph_id: String,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AnalysisRequest {
    pub fn from_job(job: &AnalysisJob) -> Self {
        Self {
            job_id: job.job_id,
            kind: job.kind,
            project_id: job.project_id.clone(),
            status: RequestStatus::Pending,
            project_graph_id: project_graph_id(&job.project_id),
            requested_at: job.requested_at,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// Graph-side identifier for a project. Kept stable across rebuilds so a
/// report can locate the snapshot it was analyzed against.
pub fn project_graph_id(project_id: &str) -> String {
    format!("vigil_project_{project_id}")
}

/// Severity scale for findings, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Note,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "Error",
            Severity::Warning => "Warning",
            Severity::Note => "Note",
            Severity::Info => "Info",
        }
    }

    /// Case-insensitive parse; `None` for anything outside the scale.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "error" => Some(Severity::Error),
            "warning" => Some(Severity::Warning),
            "note" => Some(Severity::Note),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }
}

/// File path used by the single synthetic row persisted when LLM output could
/// not be parsed into findings.
pub const RAW_FALLBACK_PATH: &str = "Raw LLM Analysis";

/// One analysis observation persisted for report rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub request_id: Uuid,
    pub file_path: String,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub suggestion: Option<String>,
    pub finding_type: String,
    /// Source excerpt for the flagged range, when file content was at hand.
    pub code_snippet: Option<String>,
    /// Full model reply; present iff structured parsing fell back.
    pub raw_llm_content: Option<String>,
}

impl Finding {
    /// The synthetic row that preserves an unparseable model reply.
    pub fn raw_fallback(request_id: Uuid, raw_content: impl Into<String>) -> Self {
        Self {
            request_id,
            file_path: RAW_FALLBACK_PATH.to_string(),
            line_start: None,
            line_end: None,
            severity: Severity::Info,
            category: "Raw Output".to_string(),
            message: "Structured parsing failed; full model output preserved.".to_string(),
            suggestion: None,
            finding_type: "raw_fallback".to_string(),
            code_snippet: None,
            raw_llm_content: Some(raw_content.into()),
        }
    }

    /// True when this row is the raw-content fallback.
    pub fn is_raw_fallback(&self) -> bool {
        self.raw_llm_content.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_envelope_round_trips_as_json() {
        let job = AnalysisJob::new(
            JobKind::FullScan,
            "proj-7",
            RepoRef {
                url: "https://example.com/repo.git".into(),
                branch: "main".into(),
                commit: None,
                pr: None,
            },
        );
        let wire = serde_json::to_string(&job).unwrap();
        let back: AnalysisJob = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, job);
        assert!(wire.contains("\"kind\":\"full_scan\""));
    }

    #[test]
    fn severity_parse_is_case_insensitive() {
        assert_eq!(Severity::parse_lenient("WARNING"), Some(Severity::Warning));
        assert_eq!(Severity::parse_lenient(" error "), Some(Severity::Error));
        assert_eq!(Severity::parse_lenient("catastrophic"), None);
    }

    #[test]
    fn raw_fallback_row_matches_contract() {
        let row = Finding::raw_fallback(Uuid::new_v4(), "free-form prose");
        assert_eq!(row.file_path, RAW_FALLBACK_PATH);
        assert_eq!(row.severity, Severity::Info);
        assert_eq!(row.raw_llm_content.as_deref(), Some("free-form prose"));
        assert!(row.is_raw_fallback());
    }

    #[test]
    fn terminal_states() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(!RequestStatus::Analyzing.is_terminal());
    }
}
