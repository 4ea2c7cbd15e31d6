//! LLM output schema and coercion
//!
//! The model is asked for a strict JSON document; what comes back is
//! untrusted. Parsing is strict on structure but permissive where coercion
//! is safe: severities fold case-insensitively and default to `Note`,
//! unknown categories fall back to `Code Quality`, and an object-shaped
//! project summary is flattened into a string from its recognizable
//! metrics. Every coercion is recorded as a warning, never an error, and
//! the whole pass is deterministic for a fixed input.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::Severity;

pub const DEFAULT_CATEGORY: &str = "Code Quality";

pub const KNOWN_CATEGORIES: &[&str] = &[
    "Architecture",
    "Security",
    "Performance",
    "Logic",
    "Lifecycle",
    "Code Quality",
];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("model reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("model reply JSON does not match the finding schema: {0}")]
    ShapeMismatch(String),
}

/// Schema description substituted into every prompt as
/// `{format_instructions}`.
pub fn format_instructions() -> String {
    let severities = "Error, Warning, Note, Info";
    let categories = KNOWN_CATEGORIES.join(", ");
    format!(
        "Reply with a single JSON object and nothing else. The object has a \
         \"findings\" array and an optional \"project_summary\" string. Each \
         finding is an object with the fields: \"file_path\" (string), \
         \"line_start\" (integer, optional), \"line_end\" (integer, \
         optional), \"severity\" (one of: {severities}), \
         \"finding_category\" (one of: {categories}), \"message\" (string), \
         \"suggestion\" (string, optional), and \"finding_type\" (short \
         string tag, optional). If there are no findings, \"findings\" is an \
         empty array."
    )
}

#[derive(Debug, Clone, Deserialize)]
struct RawFinding {
    file_path: Option<String>,
    line_start: Option<i64>,
    line_end: Option<i64>,
    severity: Option<Value>,
    #[serde(alias = "category")]
    finding_category: Option<String>,
    #[serde(alias = "description")]
    message: Option<String>,
    suggestion: Option<String>,
    finding_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawOutput {
    findings: Vec<RawFinding>,
    #[serde(default)]
    project_summary: Option<Value>,
}

/// One validated finding from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmFinding {
    pub file_path: String,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub suggestion: Option<String>,
    pub finding_type: String,
}

/// The validated, coerced reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmAnalysisOutput {
    pub findings: Vec<LlmFinding>,
    pub project_summary: Option<String>,
}

/// Parse and coerce a model reply. `warnings` records every coercion that
/// fired.
pub fn parse_structured(
    raw_content: &str,
) -> Result<(LlmAnalysisOutput, Vec<String>), SchemaError> {
    let value = extract_json(raw_content)?;
    let raw: RawOutput = serde_json::from_value(value)
        .map_err(|e| SchemaError::ShapeMismatch(e.to_string()))?;

    let mut warnings = Vec::new();
    let mut findings = Vec::new();
    for (index, finding) in raw.findings.into_iter().enumerate() {
        let Some(message) = finding.message.filter(|m| !m.trim().is_empty()) else {
            warnings.push(format!("finding #{index} dropped: empty message"));
            continue;
        };
        let file_path = finding
            .file_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| {
                warnings.push(format!("finding #{index}: missing file_path"));
                "unknown".to_string()
            });
        let severity = coerce_severity(finding.severity.as_ref(), index, &mut warnings);
        let category = coerce_category(finding.finding_category.as_deref(), index, &mut warnings);
        findings.push(LlmFinding {
            file_path,
            line_start: finding.line_start.and_then(positive_line),
            line_end: finding.line_end.and_then(positive_line),
            severity,
            category,
            message,
            suggestion: finding.suggestion.filter(|s| !s.trim().is_empty()),
            finding_type: finding
                .finding_type
                .unwrap_or_else(|| "general".to_string()),
        });
    }

    let project_summary = raw
        .project_summary
        .and_then(|value| coerce_summary(value, &mut warnings));

    Ok((
        LlmAnalysisOutput {
            findings,
            project_summary,
        },
        warnings,
    ))
}

fn positive_line(line: i64) -> Option<u32> {
    u32::try_from(line).ok().filter(|l| *l > 0)
}

fn coerce_severity(raw: Option<&Value>, index: usize, warnings: &mut Vec<String>) -> Severity {
    match raw {
        Some(Value::String(s)) => match Severity::parse_lenient(s) {
            Some(severity) => {
                if severity.as_str() != s {
                    warnings.push(format!("finding #{index}: severity {s:?} normalized"));
                }
                severity
            }
            None => {
                warnings.push(format!(
                    "finding #{index}: unknown severity {s:?}, defaulting to Note"
                ));
                Severity::Note
            }
        },
        other => {
            warnings.push(format!(
                "finding #{index}: non-string severity {other:?}, defaulting to Note"
            ));
            Severity::Note
        }
    }
}

fn coerce_category(raw: Option<&str>, index: usize, warnings: &mut Vec<String>) -> String {
    match raw {
        Some(candidate) => {
            let matched = KNOWN_CATEGORIES
                .iter()
                .find(|known| known.eq_ignore_ascii_case(candidate.trim()));
            match matched {
                Some(known) => known.to_string(),
                None => {
                    warnings.push(format!(
                        "finding #{index}: unknown category {candidate:?}, defaulting to {DEFAULT_CATEGORY}"
                    ));
                    DEFAULT_CATEGORY.to_string()
                }
            }
        }
        None => DEFAULT_CATEGORY.to_string(),
    }
}

/// An object-shaped summary is serialized from its recognizable fields
/// instead of being rejected.
fn coerce_summary(value: Value, warnings: &mut Vec<String>) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::String(_) => None,
        Value::Object(map) => {
            warnings.push("project_summary was an object; flattened to text".to_string());
            let mut parts = Vec::new();
            for key in [
                "overview",
                "summary",
                "description",
                "total_files",
                "total_classes",
                "total_functions_methods",
            ] {
                if let Some(field) = map.get(key) {
                    let rendered = match field {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    parts.push(format!("{key}: {rendered}"));
                }
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("; "))
            }
        }
        other => {
            warnings.push(format!("project_summary had unexpected type: {other:?}"));
            None
        }
    }
}

/// Strict parse first; if the reply wraps the document in prose, salvage
/// the outermost JSON object before giving up.
fn extract_json(raw_content: &str) -> Result<Value, SchemaError> {
    let trimmed = raw_content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| SchemaError::InvalidJson("no JSON object in reply".to_string()))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| SchemaError::InvalidJson("unterminated JSON object".to_string()))?;
    if end <= start {
        return Err(SchemaError::InvalidJson("unterminated JSON object".to_string()));
    }
    serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| SchemaError::InvalidJson(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_document_parses_without_warnings() {
        let raw = r#"{"findings":[{"file_path":"a.py","line_start":3,"severity":"Warning","finding_category":"Logic","message":"off by one","suggestion":"use >="}]}"#;
        let (output, warnings) = parse_structured(raw).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(output.findings.len(), 1);
        assert_eq!(output.findings[0].severity, Severity::Warning);
        assert_eq!(output.findings[0].category, "Logic");
    }

    #[test]
    fn salvages_json_wrapped_in_prose() {
        let raw = "Here's the analysis: {\"findings\":[]} hope that helps!";
        let (output, _) = parse_structured(raw).unwrap();
        assert!(output.findings.is_empty());
    }

    #[test]
    fn prose_only_reply_fails() {
        assert!(parse_structured("I could not find any issues.").is_err());
    }

    #[test]
    fn severity_coercion_is_case_insensitive_with_note_fallback() {
        let raw = r#"{"findings":[
            {"file_path":"a.py","severity":"warning","message":"m1"},
            {"file_path":"a.py","severity":"catastrophic","message":"m2"},
            {"file_path":"a.py","message":"m3"}
        ]}"#;
        let (output, warnings) = parse_structured(raw).unwrap();
        assert_eq!(output.findings[0].severity, Severity::Warning);
        assert_eq!(output.findings[1].severity, Severity::Note);
        assert_eq!(output.findings[2].severity, Severity::Note);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn unknown_category_defaults() {
        let raw = r#"{"findings":[{"file_path":"a.py","severity":"Info","finding_category":"Vibes","message":"m"}]}"#;
        let (output, warnings) = parse_structured(raw).unwrap();
        assert_eq!(output.findings[0].category, DEFAULT_CATEGORY);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn object_summary_is_flattened() {
        let raw = r#"{"findings":[],"project_summary":{"overview":"small tool","total_files":3}}"#;
        let (output, warnings) = parse_structured(raw).unwrap();
        let summary = output.project_summary.unwrap();
        assert!(summary.contains("overview: small tool"));
        assert!(summary.contains("total_files: 3"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn coercion_is_deterministic() {
        let raw = r#"{"findings":[{"file_path":"a.py","severity":"WARNING","finding_category":"nope","message":"m"}]}"#;
        let first = parse_structured(raw).unwrap();
        let second = parse_structured(raw).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn negative_lines_are_dropped() {
        let raw = r#"{"findings":[{"file_path":"a.py","line_start":-4,"line_end":0,"severity":"Info","message":"m"}]}"#;
        let (output, _) = parse_structured(raw).unwrap();
        assert_eq!(output.findings[0].line_start, None);
        assert_eq!(output.findings[0].line_end, None);
    }
}
