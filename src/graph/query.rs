//! Read-side summary and query API
//!
//! Pure functions over the graph store. `project_overview` produces the
//! exact shape the context builder feeds to the LLM; everything here is
//! pagination-safe through [`Page`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::store::{GraphBackend, GraphResult};
use super::types::{CompositeId, EdgeKind, NodeKind, NodeRecord};

/// Caller-provided pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl Page {
    pub fn clamp<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if self.offset >= items.len() {
            return Vec::new();
        }
        let mut items = items.split_off(self.offset);
        items.truncate(self.limit);
        items
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMethodCount {
    pub class_name: String,
    pub file_path: String,
    pub method_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallCount {
    pub function_name: String,
    pub file_path: String,
    pub call_count: usize,
}

/// The single source of truth handed to the LLM about a project's shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectOverview {
    pub total_files: usize,
    pub total_classes: usize,
    pub total_functions_methods: usize,
    pub average_functions_per_file: f64,
    pub main_modules: Vec<String>,
    pub top_5_largest_classes_by_methods: Vec<ClassMethodCount>,
    pub top_5_most_called_functions: Vec<FunctionCallCount>,
}

impl ProjectOverview {
    /// The meaningful-data check: an empty overview must not reach the LLM.
    pub fn has_meaningful_data(&self) -> bool {
        self.total_files > 0
            && !(self.main_modules.is_empty()
                && self.top_5_largest_classes_by_methods.is_empty()
                && self.top_5_most_called_functions.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    pub caller_name: String,
    pub caller_file: String,
    pub caller_class: Option<String>,
    pub callee_name: String,
    pub callee_file: String,
    pub callee_class: Option<String>,
    pub call_line: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritanceInfo {
    pub child_class: String,
    pub child_file: String,
    pub parent_class: String,
    pub parent_file: String,
    pub parent_placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub name: String,
    pub kind: String,
    pub file_path: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub affected_function_count: usize,
    pub files_to_update: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub function_name: String,
    pub class_name: Option<String>,
    pub start_line: u64,
    pub end_line: u64,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUsage {
    pub variable_name: String,
    pub file_path: String,
    pub scope_type: String,
    pub used_by_functions: Vec<String>,
    pub modified_by_functions: Vec<String>,
}

pub struct QueryApi {
    graph: Arc<dyn GraphBackend>,
}

impl QueryApi {
    pub fn new(graph: Arc<dyn GraphBackend>) -> Self {
        Self { graph }
    }

    pub async fn project_overview(&self, project_graph_id: &str) -> GraphResult<ProjectOverview> {
        let files = self
            .graph
            .nodes_by_kind(NodeKind::File, project_graph_id)
            .await?;
        let classes = self
            .graph
            .nodes_by_kind(NodeKind::Class, project_graph_id)
            .await?;
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, project_graph_id)
            .await?;

        let concrete_classes: Vec<&NodeRecord> = classes
            .iter()
            .filter(|c| !c.bool_prop("placeholder"))
            .collect();

        // Top-level path segments stand in for the project's main modules.
        let mut main_modules: BTreeSet<String> = BTreeSet::new();
        for file in &files {
            if let Some(path) = file.str_prop("path") {
                let top = path.split('/').next().unwrap_or(path);
                main_modules.insert(top.to_string());
            }
        }
        let main_modules: Vec<String> = main_modules.into_iter().take(10).collect();

        let mut class_sizes: Vec<ClassMethodCount> = Vec::new();
        for class in &concrete_classes {
            let name = class.str_prop("name").unwrap_or_default().to_string();
            let file_path = class.str_prop("file_path").unwrap_or_default().to_string();
            let method_count = functions
                .iter()
                .filter(|f| {
                    f.str_prop("class_name") == Some(name.as_str())
                        && f.str_prop("file_path") == Some(file_path.as_str())
                })
                .count();
            if method_count > 0 {
                class_sizes.push(ClassMethodCount {
                    class_name: name,
                    file_path,
                    method_count,
                });
            }
        }
        class_sizes.sort_by(|a, b| {
            b.method_count
                .cmp(&a.method_count)
                .then_with(|| a.class_name.cmp(&b.class_name))
        });
        class_sizes.truncate(5);

        let mut call_counts: Vec<FunctionCallCount> = Vec::new();
        for function in &functions {
            let inbound = self
                .graph
                .edges_to(&function.id, Some(EdgeKind::Calls))
                .await?
                .len();
            if inbound > 0 {
                call_counts.push(FunctionCallCount {
                    function_name: function.str_prop("name").unwrap_or_default().to_string(),
                    file_path: function
                        .str_prop("file_path")
                        .unwrap_or_default()
                        .to_string(),
                    call_count: inbound,
                });
            }
        }
        call_counts.sort_by(|a, b| {
            b.call_count
                .cmp(&a.call_count)
                .then_with(|| a.function_name.cmp(&b.function_name))
        });
        call_counts.truncate(5);

        let total_files = files.len();
        let total_functions_methods = functions.len();
        Ok(ProjectOverview {
            total_files,
            total_classes: concrete_classes.len(),
            total_functions_methods,
            average_functions_per_file: if total_files == 0 {
                0.0
            } else {
                total_functions_methods as f64 / total_files as f64
            },
            main_modules,
            top_5_largest_classes_by_methods: class_sizes,
            top_5_most_called_functions: call_counts,
        })
    }

    /// Call relationships, optionally narrowed to one function name on
    /// either end.
    pub async fn function_call_relationships(
        &self,
        project_graph_id: &str,
        function_name: Option<&str>,
        page: Page,
    ) -> GraphResult<Vec<CallInfo>> {
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, project_graph_id)
            .await?;
        let by_id: HashMap<&CompositeId, &NodeRecord> =
            functions.iter().map(|f| (&f.id, f)).collect();

        let mut out = Vec::new();
        let mut edges = self
            .graph
            .edges_by_kind(EdgeKind::Calls, project_graph_id)
            .await?;
        edges.sort_by(|a, b| a.src.cmp(&b.src).then_with(|| a.dst.cmp(&b.dst)));
        for edge in edges {
            let (Some(caller), Some(callee)) = (by_id.get(&edge.src), by_id.get(&edge.dst))
            else {
                continue;
            };
            let caller_name = caller.str_prop("name").unwrap_or_default();
            let callee_name = callee.str_prop("name").unwrap_or_default();
            if let Some(filter) = function_name {
                if caller_name != filter && callee_name != filter {
                    continue;
                }
            }
            out.push(CallInfo {
                caller_name: caller_name.to_string(),
                caller_file: caller.str_prop("file_path").unwrap_or_default().to_string(),
                caller_class: caller.str_prop("class_name").map(str::to_string),
                callee_name: callee_name.to_string(),
                callee_file: callee.str_prop("file_path").unwrap_or_default().to_string(),
                callee_class: callee.str_prop("class_name").map(str::to_string),
                call_line: edge.properties.get("call_site_line").and_then(|v| v.as_u64()),
            });
        }
        Ok(page.clamp(out))
    }

    /// Inheritance pairs, optionally narrowed to one class name on either
    /// side.
    pub async fn class_inheritance(
        &self,
        project_graph_id: &str,
        class_name: Option<&str>,
        page: Page,
    ) -> GraphResult<Vec<InheritanceInfo>> {
        let classes = self
            .graph
            .nodes_by_kind(NodeKind::Class, project_graph_id)
            .await?;
        let by_id: HashMap<&CompositeId, &NodeRecord> =
            classes.iter().map(|c| (&c.id, c)).collect();

        let mut out = Vec::new();
        let mut edges = self
            .graph
            .edges_by_kind(EdgeKind::InheritsFrom, project_graph_id)
            .await?;
        edges.sort_by(|a, b| a.src.cmp(&b.src).then_with(|| a.dst.cmp(&b.dst)));
        for edge in edges {
            let (Some(child), Some(parent)) = (by_id.get(&edge.src), by_id.get(&edge.dst))
            else {
                continue;
            };
            let child_name = child.str_prop("name").unwrap_or_default();
            let parent_name = parent.str_prop("name").unwrap_or_default();
            if let Some(filter) = class_name {
                if child_name != filter && parent_name != filter {
                    continue;
                }
            }
            out.push(InheritanceInfo {
                child_class: child_name.to_string(),
                child_file: child.str_prop("file_path").unwrap_or_default().to_string(),
                parent_class: parent_name.to_string(),
                parent_file: parent.str_prop("file_path").unwrap_or_default().to_string(),
                parent_placeholder: parent.bool_prop("placeholder"),
            });
        }
        Ok(page.clamp(out))
    }

    /// Cycles in the call graph up to `max_depth` hops, deduplicated by
    /// rotation so each cycle is reported once.
    pub async fn circular_function_calls(
        &self,
        project_graph_id: &str,
        max_depth: usize,
        page: Page,
    ) -> GraphResult<Vec<Vec<String>>> {
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, project_graph_id)
            .await?;
        let names: HashMap<&CompositeId, String> = functions
            .iter()
            .map(|f| (&f.id, f.str_prop("name").unwrap_or_default().to_string()))
            .collect();
        let edges = self
            .graph
            .edges_by_kind(EdgeKind::Calls, project_graph_id)
            .await?;
        let mut adjacency: BTreeMap<&CompositeId, Vec<&CompositeId>> = BTreeMap::new();
        for edge in &edges {
            adjacency.entry(&edge.src).or_default().push(&edge.dst);
        }

        let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();
        let mut cycles = Vec::new();
        for start in adjacency.keys().copied() {
            let mut stack = vec![start];
            self.dfs_cycles(
                start,
                start,
                &adjacency,
                &names,
                &mut stack,
                max_depth,
                &mut seen,
                &mut cycles,
            );
        }
        Ok(page.clamp(cycles))
    }

    #[allow(clippy::too_many_arguments)]
    fn dfs_cycles<'a>(
        &self,
        start: &'a CompositeId,
        current: &'a CompositeId,
        adjacency: &BTreeMap<&'a CompositeId, Vec<&'a CompositeId>>,
        names: &HashMap<&CompositeId, String>,
        stack: &mut Vec<&'a CompositeId>,
        remaining: usize,
        seen: &mut BTreeSet<Vec<String>>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        if remaining == 0 {
            return;
        }
        let Some(successors) = adjacency.get(current) else {
            return;
        };
        for &next in successors {
            if next == start {
                let mut cycle: Vec<String> = stack
                    .iter()
                    .map(|id| names.get(*id).cloned().unwrap_or_default())
                    .collect();
                // Canonical rotation keeps each cycle unique regardless of
                // which member the walk started from.
                if let Some(min_pos) = cycle
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.cmp(b.1))
                    .map(|(i, _)| i)
                {
                    cycle.rotate_left(min_pos);
                }
                if seen.insert(cycle.clone()) {
                    cycles.push(cycle);
                }
                continue;
            }
            if stack.contains(&next) {
                continue;
            }
            stack.push(next);
            self.dfs_cycles(
                start,
                next,
                adjacency,
                names,
                stack,
                remaining - 1,
                seen,
                cycles,
            );
            stack.pop();
        }
    }

    /// Classes at or above `min_methods` methods, largest first.
    pub async fn large_classes(
        &self,
        project_graph_id: &str,
        min_methods: usize,
        page: Page,
    ) -> GraphResult<Vec<ClassMethodCount>> {
        let classes = self
            .graph
            .nodes_by_kind(NodeKind::Class, project_graph_id)
            .await?;
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, project_graph_id)
            .await?;
        let mut out = Vec::new();
        for class in classes.iter().filter(|c| !c.bool_prop("placeholder")) {
            let name = class.str_prop("name").unwrap_or_default();
            let file_path = class.str_prop("file_path").unwrap_or_default();
            let method_count = functions
                .iter()
                .filter(|f| {
                    f.str_prop("class_name") == Some(name)
                        && f.str_prop("file_path") == Some(file_path)
                })
                .count();
            if method_count >= min_methods {
                out.push(ClassMethodCount {
                    class_name: name.to_string(),
                    file_path: file_path.to_string(),
                    method_count,
                });
            }
        }
        out.sort_by(|a, b| {
            b.method_count
                .cmp(&a.method_count)
                .then_with(|| a.class_name.cmp(&b.class_name))
        });
        Ok(page.clamp(out))
    }

    /// Case-insensitive substring search over entity names.
    pub async fn search(
        &self,
        project_graph_id: &str,
        term: &str,
        kinds: &[NodeKind],
        page: Page,
    ) -> GraphResult<Vec<SearchHit>> {
        let needle = term.to_lowercase();
        let mut out = Vec::new();
        for kind in kinds {
            let nodes = self.graph.nodes_by_kind(*kind, project_graph_id).await?;
            for node in nodes {
                let Some(name) = node.str_prop("name") else {
                    continue;
                };
                if !name.to_lowercase().contains(&needle) {
                    continue;
                }
                let detail = match kind {
                    NodeKind::Function => node.str_prop("signature").map(str::to_string),
                    NodeKind::Variable => node.str_prop("scope_type").map(str::to_string),
                    _ => None,
                };
                out.push(SearchHit {
                    name: name.to_string(),
                    kind: kind.as_str().to_string(),
                    file_path: node.str_prop("file_path").unwrap_or_default().to_string(),
                    detail,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.kind.cmp(&b.kind)));
        Ok(page.clamp(out))
    }

    /// Which functions and files a change to `paths` would touch: the
    /// symbols in those files plus everything calling into them.
    pub async fn impact_of_changes(
        &self,
        project_graph_id: &str,
        paths: &[String],
    ) -> GraphResult<ImpactReport> {
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, project_graph_id)
            .await?;
        let mut affected: BTreeSet<CompositeId> = BTreeSet::new();
        let mut files: BTreeSet<String> = paths.iter().cloned().collect();

        for function in functions
            .iter()
            .filter(|f| matches_path(f, paths))
        {
            affected.insert(function.id.clone());
            for edge in self
                .graph
                .edges_to(&function.id, Some(EdgeKind::Calls))
                .await?
            {
                if let Some(caller) = self.graph.get_node(&edge.src).await? {
                    affected.insert(caller.id.clone());
                    if let Some(file) = caller.str_prop("file_path") {
                        if !file.is_empty() {
                            files.insert(file.to_string());
                        }
                    }
                }
            }
        }
        Ok(ImpactReport {
            affected_function_count: affected.len(),
            files_to_update: files.into_iter().collect(),
        })
    }

    /// All functions defined in one file, ordered by start line.
    pub async fn functions_in_file(
        &self,
        project_graph_id: &str,
        path: &str,
        page: Page,
    ) -> GraphResult<Vec<FunctionInfo>> {
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, project_graph_id)
            .await?;
        let mut out: Vec<FunctionInfo> = functions
            .iter()
            .filter(|f| f.str_prop("file_path") == Some(path))
            .map(|f| FunctionInfo {
                function_name: f.str_prop("name").unwrap_or_default().to_string(),
                class_name: f.str_prop("class_name").map(str::to_string),
                start_line: f.u64_prop("start_line").unwrap_or_default(),
                end_line: f.u64_prop("end_line").unwrap_or_default(),
                signature: f.str_prop("signature").unwrap_or_default().to_string(),
            })
            .collect();
        out.sort_by_key(|f| f.start_line);
        Ok(page.clamp(out))
    }

    /// Where a named variable is read and written.
    pub async fn variable_usage(
        &self,
        project_graph_id: &str,
        variable_name: &str,
        page: Page,
    ) -> GraphResult<Vec<VariableUsage>> {
        let variables = self
            .graph
            .nodes_by_name(NodeKind::Variable, project_graph_id, variable_name)
            .await?;
        let mut out = Vec::new();
        for variable in variables {
            let mut used_by = BTreeSet::new();
            for edge in self
                .graph
                .edges_to(&variable.id, Some(EdgeKind::UsesVariable))
                .await?
            {
                if let Some(user) = self.graph.get_node(&edge.src).await? {
                    used_by.insert(user.str_prop("name").unwrap_or_default().to_string());
                }
            }
            let mut modified_by = BTreeSet::new();
            for edge in self
                .graph
                .edges_to(&variable.id, Some(EdgeKind::ModifiesVariable))
                .await?
            {
                if let Some(writer) = self.graph.get_node(&edge.src).await? {
                    modified_by.insert(writer.str_prop("name").unwrap_or_default().to_string());
                }
            }
            out.push(VariableUsage {
                variable_name: variable.str_prop("name").unwrap_or_default().to_string(),
                file_path: variable.str_prop("file_path").unwrap_or_default().to_string(),
                scope_type: variable.str_prop("scope_type").unwrap_or_default().to_string(),
                used_by_functions: used_by.into_iter().collect(),
                modified_by_functions: modified_by.into_iter().collect(),
            });
        }
        out.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(page.clamp(out))
    }
}

fn matches_path(node: &NodeRecord, paths: &[String]) -> bool {
    node.str_prop("file_path")
        .map(|p| paths.iter().any(|candidate| candidate == p))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::graph::builder::{CkgBuilder, ProjectDescriptor};
    use crate::graph::store::MemoryGraph;
    use crate::language::ParserRegistry;
    use std::fs;
    use tempfile::TempDir;

    async fn seeded() -> (Arc<dyn GraphBackend>, ProjectDescriptor, TempDir) {
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let registry = Arc::new(ParserRegistry::with_builtin_languages(1_048_576).unwrap());
        let builder = CkgBuilder::new(Arc::clone(&graph), registry, 50, 10_000, 4);
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("shapes.py"),
            r#"
class Shape:
    def area(self):
        pass

    def describe(self):
        return self.area()

class Circle(Shape):
    def area(self):
        return 3

def render(shape):
    shape.describe()

def ping():
    pong()

def pong():
    ping()
"#,
        )
        .unwrap();
        let project = ProjectDescriptor::new("1", "shapes", "python");
        builder
            .build_project(&project, dir.path(), &CancelToken::new())
            .await
            .unwrap();
        (graph, project, dir)
    }

    #[tokio::test]
    async fn overview_counts_and_top_lists() {
        let (graph, project, _dir) = seeded().await;
        let api = QueryApi::new(graph);
        let overview = api.project_overview(&project.graph_id).await.unwrap();
        assert_eq!(overview.total_files, 1);
        assert_eq!(overview.total_classes, 2);
        assert_eq!(overview.total_functions_methods, 6);
        assert!(overview.average_functions_per_file > 5.9);
        assert!(overview.has_meaningful_data());
        assert_eq!(overview.main_modules, vec!["shapes.py".to_string()]);
        assert!(!overview.top_5_largest_classes_by_methods.is_empty());
        assert_eq!(
            overview.top_5_largest_classes_by_methods[0].class_name,
            "Shape"
        );
    }

    #[tokio::test]
    async fn empty_project_has_no_meaningful_data() {
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let api = QueryApi::new(graph);
        let overview = api.project_overview("vigil_project_none").await.unwrap();
        assert_eq!(overview.total_files, 0);
        assert!(!overview.has_meaningful_data());
    }

    #[tokio::test]
    async fn inheritance_resolves_to_parent() {
        let (graph, project, _dir) = seeded().await;
        let api = QueryApi::new(graph);
        let pairs = api
            .class_inheritance(&project.graph_id, Some("Circle"), Page::default())
            .await
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].parent_class, "Shape");
        assert!(!pairs[0].parent_placeholder);
    }

    #[tokio::test]
    async fn detects_call_cycles() {
        let (graph, project, _dir) = seeded().await;
        let api = QueryApi::new(graph);
        let cycles = api
            .circular_function_calls(&project.graph_id, 10, Page::default())
            .await
            .unwrap();
        assert!(cycles
            .iter()
            .any(|c| c.contains(&"ping".to_string()) && c.contains(&"pong".to_string())));
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_paginated() {
        let (graph, project, _dir) = seeded().await;
        let api = QueryApi::new(graph);
        let hits = api
            .search(
                &project.graph_id,
                "SHAPE",
                &[NodeKind::Class, NodeKind::Function],
                Page::default(),
            )
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.name == "Shape" && h.kind == "Class"));

        let first_page = api
            .search(
                &project.graph_id,
                "",
                &[NodeKind::Function],
                Page {
                    limit: 2,
                    offset: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(first_page.len(), 2);
    }

    #[tokio::test]
    async fn impact_includes_callers_of_changed_files() {
        let (graph, project, _dir) = seeded().await;
        let api = QueryApi::new(graph);
        let impact = api
            .impact_of_changes(&project.graph_id, &["shapes.py".to_string()])
            .await
            .unwrap();
        assert!(impact.affected_function_count >= 6);
        assert_eq!(impact.files_to_update, vec!["shapes.py".to_string()]);
    }
}
