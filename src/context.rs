//! Prompt context assembly
//!
//! Synthesizes the exact variable set the prompt templates expect from the
//! graph overview, the job metadata, and the working tree. The overview is
//! embedded verbatim as `ckg_summary`; a few of its metrics are also
//! flattened into standalone variables because the templates reference them
//! directly.
//!
//! The meaningful-data check lives here: an overview with no files or with
//! all of its top lists empty never reaches the LLM. The caller gets a
//! synthetic summary instead, which both saves tokens and keeps the model
//! from inventing content for an empty graph.

use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{info, warn};

use crate::fetch::PrDelta;
use crate::graph::{ProjectDescriptor, ProjectOverview};
use crate::llm::format_instructions;
use crate::models::{AnalysisJob, PrMetadata};

const DEFAULT_PREVIEW_FILES: usize = 10;
const DEFAULT_PREVIEW_BYTES: usize = 2_000;
const MAX_DIFF_BYTES: usize = 8_000;
const MAX_CHANGED_FILE_BYTES: usize = 4_000;

/// Either the full variable set, or the synthetic summary produced when the
/// graph has nothing meaningful to analyze.
#[derive(Debug, Clone)]
pub enum BuiltContext {
    Ready(Map<String, Value>),
    Empty { project_summary: String },
}

pub struct ContextBuilder {
    preview_files: usize,
    preview_bytes: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            preview_files: DEFAULT_PREVIEW_FILES,
            preview_bytes: DEFAULT_PREVIEW_BYTES,
        }
    }
}

impl ContextBuilder {
    pub fn new(preview_files: usize, preview_bytes: usize) -> Self {
        Self {
            preview_files,
            preview_bytes,
        }
    }

    /// Variable set for a full-project scan.
    pub fn build_full_scan(
        &self,
        project: &ProjectDescriptor,
        job: &AnalysisJob,
        overview: &ProjectOverview,
        workspace_root: &Path,
    ) -> BuiltContext {
        if !overview.has_meaningful_data() {
            warn!(
                project = %job.project_id,
                total_files = overview.total_files,
                "overview has no meaningful data, skipping LLM"
            );
            return BuiltContext::Empty {
                project_summary: synthetic_summary(&project.name, overview),
            };
        }

        let mut variables = Map::new();
        variables.insert("project_name".into(), json!(project.name));
        variables.insert("project_language".into(), json!(project.language));
        variables.insert("main_branch".into(), json!(job.repo_ref.branch));
        variables.insert(
            "project_custom_notes".into(),
            json!(notes_or_default(&job.project_notes)),
        );
        variables.insert("output_language".into(), json!(job.output_language));
        variables.insert(
            "ckg_summary".into(),
            json!(serde_json::to_string_pretty(overview).unwrap_or_default()),
        );
        variables.insert("total_files".into(), json!(overview.total_files));
        variables.insert("total_classes".into(), json!(overview.total_classes));
        variables.insert(
            "total_functions_methods".into(),
            json!(overview.total_functions_methods),
        );
        variables.insert(
            "average_functions_per_file".into(),
            json!(format!("{:.2}", overview.average_functions_per_file)),
        );
        variables.insert(
            "important_files_preview".into(),
            json!(self.important_files_preview(overview, workspace_root)),
        );
        variables.insert(
            "directory_listing_top_level".into(),
            json!(directory_listing(workspace_root)),
        );
        variables.insert("format_instructions".into(), json!(format_instructions()));

        info!(
            project = %job.project_id,
            variables = variables.len(),
            "assembled full-scan context"
        );
        BuiltContext::Ready(variables)
    }

    /// Variable set for a PR scan: the full-scan set plus the PR metadata,
    /// diff, and changed-file contents.
    pub fn build_pr_scan(
        &self,
        project: &ProjectDescriptor,
        job: &AnalysisJob,
        overview: &ProjectOverview,
        workspace_root: &Path,
        pr: &PrMetadata,
        delta: &PrDelta,
    ) -> BuiltContext {
        let base = match self.build_full_scan(project, job, overview, workspace_root) {
            BuiltContext::Ready(variables) => variables,
            empty @ BuiltContext::Empty { .. } => return empty,
        };
        let mut variables = base;
        variables.insert("pr_title".into(), json!(pr.title));
        variables.insert("pr_description".into(), json!(pr.description));
        variables.insert("pr_author".into(), json!(pr.author));
        variables.insert("head_branch".into(), json!(pr.head_branch));
        variables.insert("base_branch".into(), json!(pr.base_branch));
        variables.insert(
            "pr_diff_content".into(),
            json!(truncate(&delta.diff, MAX_DIFF_BYTES)),
        );
        variables.insert(
            "formatted_changed_files_with_content".into(),
            json!(format_changed_files(delta)),
        );
        BuiltContext::Ready(variables)
    }

    /// Up to N important files with their first K bytes. Files named by the
    /// overview's top lists come first; the remainder fills from the tree.
    fn important_files_preview(&self, overview: &ProjectOverview, root: &Path) -> String {
        let mut picked: Vec<String> = Vec::new();
        for class in &overview.top_5_largest_classes_by_methods {
            if !class.file_path.is_empty() && !picked.contains(&class.file_path) {
                picked.push(class.file_path.clone());
            }
        }
        for function in &overview.top_5_most_called_functions {
            if !function.file_path.is_empty() && !picked.contains(&function.file_path) {
                picked.push(function.file_path.clone());
            }
        }
        picked.truncate(self.preview_files);

        let mut sections = Vec::new();
        for path in &picked {
            let Ok(content) = std::fs::read_to_string(root.join(path)) else {
                continue;
            };
            sections.push(format!(
                "### {path}\n```\n{}\n```",
                truncate(&content, self.preview_bytes)
            ));
        }
        if sections.is_empty() {
            "No file previews available.".to_string()
        } else {
            sections.join("\n\n")
        }
    }
}

fn notes_or_default(notes: &str) -> String {
    if notes.trim().is_empty() {
        "No custom project notes provided.".to_string()
    } else {
        notes.to_string()
    }
}

fn directory_listing(root: &Path) -> String {
    let mut entries: Vec<String> = Vec::new();
    if let Ok(dir) = std::fs::read_dir(root) {
        for entry in dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(name);
            }
        }
    }
    entries.sort();
    if entries.is_empty() {
        "(empty)".to_string()
    } else {
        entries.join("\n")
    }
}

fn format_changed_files(delta: &PrDelta) -> String {
    if delta.changed_files.is_empty() {
        return "No relevant file content available for analysis.".to_string();
    }
    let mut sections = Vec::new();
    for file in &delta.changed_files {
        let mut section = format!("File: {}\nStatus: {}\n", file.path, file.status);
        if let Some(content) = &file.content {
            section.push_str(&format!(
                "Content:\n```\n{}\n```",
                truncate(content, MAX_CHANGED_FILE_BYTES)
            ));
        }
        sections.push(section);
    }
    sections.join("\n---\n")
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &text[..end])
}

fn synthetic_summary(project_name: &str, overview: &ProjectOverview) -> String {
    if overview.total_files == 0 {
        format!(
            "Project {project_name} contains no analyzable source files. \
             No analysis was performed."
        )
    } else {
        format!(
            "Project {project_name} has {files} files but the knowledge graph \
             holds no classes, functions, or modules to reason about. \
             No analysis was performed.",
            files = overview.total_files
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::query::{ClassMethodCount, FunctionCallCount};
    use crate::models::{JobKind, RepoRef};
    use crate::prompts::{PromptEngine, FULL_PROJECT_ARCHITECTURE, PR_DEEP_LOGIC};
    use tempfile::TempDir;

    fn job(kind: JobKind) -> AnalysisJob {
        AnalysisJob::new(
            kind,
            "p1",
            RepoRef {
                url: "https://example.com/r.git".into(),
                branch: "main".into(),
                commit: None,
                pr: None,
            },
        )
    }

    fn overview() -> ProjectOverview {
        ProjectOverview {
            total_files: 2,
            total_classes: 1,
            total_functions_methods: 3,
            average_functions_per_file: 1.5,
            main_modules: vec!["src".into()],
            top_5_largest_classes_by_methods: vec![ClassMethodCount {
                class_name: "Alpha".into(),
                file_path: "src/alpha.py".into(),
                method_count: 2,
            }],
            top_5_most_called_functions: vec![FunctionCallCount {
                function_name: "helper".into(),
                file_path: "src/lib.py".into(),
                call_count: 4,
            }],
        }
    }

    #[test]
    fn full_scan_context_covers_the_template() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/alpha.py"), "class Alpha: pass\n").unwrap();
        let context = ContextBuilder::default().build_full_scan(
            &ProjectDescriptor::new("p1", "demo", "python"),
            &job(JobKind::FullScan),
            &overview(),
            dir.path(),
        );
        let BuiltContext::Ready(variables) = context else {
            panic!("expected ready context");
        };
        let engine = PromptEngine::new(None);
        // Every placeholder the template needs must be present.
        engine
            .render(FULL_PROJECT_ARCHITECTURE, &variables)
            .unwrap();
        assert!(variables["ckg_summary"]
            .as_str()
            .unwrap()
            .contains("top_5_most_called_functions"));
        assert!(variables["important_files_preview"]
            .as_str()
            .unwrap()
            .contains("src/alpha.py"));
    }

    #[test]
    fn pr_scan_context_covers_the_pr_template() {
        let dir = TempDir::new().unwrap();
        let pr = PrMetadata {
            number: 7,
            title: "Fix".into(),
            description: "desc".into(),
            author: "dev".into(),
            base_branch: "main".into(),
            head_branch: "fix/thing".into(),
        };
        let delta = PrDelta {
            changed_files: vec![crate::fetch::ChangedFile {
                path: "src/a.py".into(),
                status: "modified".into(),
                content: Some("x = 1\n".into()),
            }],
            diff: "--- a\n+++ b\n".into(),
        };
        let context = ContextBuilder::default().build_pr_scan(
            &ProjectDescriptor::new("p1", "demo", "python"),
            &job(JobKind::PrScan),
            &overview(),
            dir.path(),
            &pr,
            &delta,
        );
        let BuiltContext::Ready(variables) = context else {
            panic!("expected ready context");
        };
        PromptEngine::new(None)
            .render(PR_DEEP_LOGIC, &variables)
            .unwrap();
        assert!(variables["formatted_changed_files_with_content"]
            .as_str()
            .unwrap()
            .contains("src/a.py"));
    }

    #[test]
    fn empty_overview_short_circuits() {
        let dir = TempDir::new().unwrap();
        let empty = ProjectOverview::default();
        let context = ContextBuilder::default().build_full_scan(
            &ProjectDescriptor::new("p1", "demo", "python"),
            &job(JobKind::FullScan),
            &empty,
            dir.path(),
        );
        let BuiltContext::Empty { project_summary } = context else {
            panic!("expected empty context");
        };
        assert!(project_summary.contains("no analyzable source"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld".repeat(100);
        let cut = truncate(&text, 10);
        assert!(cut.contains("(truncated)"));
        // Does not panic on multibyte boundaries.
        let _ = truncate("ééééé", 3);
    }
}
