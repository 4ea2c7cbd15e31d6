//! Prompt templates
//!
//! Templates are plain text files with `{placeholder}` substitution. Six
//! ship embedded in the binary: the PR deep-logic analysis, the full-project
//! architectural analysis, and four specialty templates sharing the same
//! variable schema. A configured prompt directory overrides any of them by
//! file name.

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

pub const PR_DEEP_LOGIC: &str = "pr_deep_logic";
pub const FULL_PROJECT_ARCHITECTURE: &str = "full_project_architecture";
pub const SECURITY: &str = "security_analysis";
pub const PERFORMANCE: &str = "performance_analysis";
pub const LIFECYCLE: &str = "lifecycle_analysis";
pub const CODE_REVIEW: &str = "code_review";

static EMBEDDED: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (PR_DEEP_LOGIC, include_str!("../prompts/pr_deep_logic.md")),
        (
            FULL_PROJECT_ARCHITECTURE,
            include_str!("../prompts/full_project_architecture.md"),
        ),
        (SECURITY, include_str!("../prompts/security_analysis.md")),
        (PERFORMANCE, include_str!("../prompts/performance_analysis.md")),
        (LIFECYCLE, include_str!("../prompts/lifecycle_analysis.md")),
        (CODE_REVIEW, include_str!("../prompts/code_review.md")),
    ])
});

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown prompt template: {name}")]
    NotFound { name: String },

    #[error("template {template} is missing variables: {variables:?}")]
    MissingVariables {
        template: String,
        variables: Vec<String>,
    },
}

/// A loaded template plus the placeholder names found in it.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub content: String,
    pub variables: Vec<String>,
}

impl PromptTemplate {
    fn new(name: &str, content: String) -> Self {
        let variables = scan_placeholders(&content);
        Self {
            name: name.to_string(),
            content,
            variables,
        }
    }
}

pub struct PromptEngine {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptEngine {
    /// Engine over the embedded templates, with files from `override_dir`
    /// (matched by `<name>.md`) taking precedence.
    pub fn new(override_dir: Option<&Path>) -> Self {
        let mut templates = HashMap::new();
        for (name, content) in EMBEDDED.iter() {
            templates.insert(
                name.to_string(),
                PromptTemplate::new(name, content.to_string()),
            );
        }
        if let Some(dir) = override_dir {
            for name in EMBEDDED.keys() {
                let candidate = dir.join(format!("{name}.md"));
                match std::fs::read_to_string(&candidate) {
                    Ok(content) => {
                        debug!(template = name, path = %candidate.display(), "template override loaded");
                        templates.insert(name.to_string(), PromptTemplate::new(name, content));
                    }
                    Err(_) => {
                        if candidate.exists() {
                            warn!(path = %candidate.display(), "unreadable template override ignored");
                        }
                    }
                }
            }
        }
        Self { templates }
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate, PromptError> {
        self.templates.get(name).ok_or_else(|| PromptError::NotFound {
            name: name.to_string(),
        })
    }

    /// Substitute every `{placeholder}` with its variable. All placeholders
    /// must be covered; unknown extra variables are fine.
    pub fn render(
        &self,
        name: &str,
        variables: &Map<String, Value>,
    ) -> Result<String, PromptError> {
        let template = self.get(name)?;
        let missing: Vec<String> = template
            .variables
            .iter()
            .filter(|v| !variables.contains_key(*v))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PromptError::MissingVariables {
                template: name.to_string(),
                variables: missing,
            });
        }
        let mut rendered = template.content.clone();
        for variable in &template.variables {
            let value = variables
                .get(variable)
                .map(render_value)
                .unwrap_or_default();
            rendered = rendered.replace(&format!("{{{variable}}}"), &value);
        }
        Ok(rendered)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Placeholder names: `{ident}` where ident is an identifier. Anything else
/// between braces is left alone.
fn scan_placeholders(content: &str) -> Vec<String> {
    let bytes = content.as_bytes();
    let mut found = BTreeSet::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b'}' {
                found.insert(content[start..end].to_string());
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    found.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn all_six_templates_are_embedded() {
        let engine = PromptEngine::new(None);
        for name in [
            PR_DEEP_LOGIC,
            FULL_PROJECT_ARCHITECTURE,
            SECURITY,
            PERFORMANCE,
            LIFECYCLE,
            CODE_REVIEW,
        ] {
            let template = engine.get(name).unwrap();
            assert!(!template.variables.is_empty(), "{name} has no variables");
            assert!(
                template.variables.contains(&"format_instructions".to_string()),
                "{name} must request the serialization schema"
            );
        }
    }

    #[test]
    fn render_substitutes_and_rejects_missing() {
        let engine = PromptEngine::new(None);
        let template = engine.get(FULL_PROJECT_ARCHITECTURE).unwrap().clone();
        let mut variables = Map::new();
        for name in &template.variables {
            variables.insert(name.clone(), json!(format!("<{name}>")));
        }
        let rendered = engine
            .render(FULL_PROJECT_ARCHITECTURE, &variables)
            .unwrap();
        assert!(rendered.contains("<project_name>"));
        assert!(!rendered.contains("{project_name}"));

        let err = engine
            .render(FULL_PROJECT_ARCHITECTURE, &Map::new())
            .unwrap_err();
        assert!(matches!(err, PromptError::MissingVariables { .. }));
    }

    #[test]
    fn placeholder_scanner_ignores_non_identifiers() {
        let found = scan_placeholders("a {one} b {two_2} c {not valid} d { } e {one}");
        assert_eq!(found, vec!["one".to_string(), "two_2".to_string()]);
    }

    #[test]
    fn overrides_win_over_embedded() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("code_review.md"),
            "custom {format_instructions}",
        )
        .unwrap();
        let engine = PromptEngine::new(Some(dir.path()));
        assert!(engine.get(CODE_REVIEW).unwrap().content.starts_with("custom"));
        // Untouched templates still come from the embedded set.
        assert!(engine.get(SECURITY).unwrap().content.len() > 100);
    }
}
