//! CKG construction
//!
//! Walks a working tree, dispatches files to the parser registry, and turns
//! [`ParsedFile`] records into batched graph transactions. Each batch upserts
//! the project and file nodes, clears the files' previous symbols, inserts
//! the new entity set, then runs cross-file resolution against the project
//! symbol index.
//!
//! Resolution is two-pass: parsers emit symbolic targets, and this module
//! resolves them here once the batch has landed. Inheritance and creation
//! targets that stay unresolved get a placeholder class; call targets that
//! stay unresolved are dropped and counted, since most of them are library
//! or builtin functions the graph will never contain.

use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, Canceled};
use crate::language::{ParseError, ParsedFile, ParserRegistry};

use super::store::{GraphBackend, GraphError};
use super::types::{
    BuildStats, CompositeId, EdgeKind, EdgeRecord, NodeKind, NodeRecord, SymbolHint,
    UnresolvedRef, WriteBatch,
};

/// Directory names never descended into during a tree walk.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "target",
    "build",
    "dist",
    ".idea",
    ".vscode",
];

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Canceled(#[from] Canceled),

    #[error("i/o error during build: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse task failed: {0}")]
    Task(String),
}

/// Identity of the project a build writes into.
#[derive(Debug, Clone)]
pub struct ProjectDescriptor {
    pub project_id: String,
    pub graph_id: String,
    pub name: String,
    pub language: String,
}

impl ProjectDescriptor {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, language: impl Into<String>) -> Self {
        let project_id = project_id.into();
        Self {
            graph_id: crate::models::project_graph_id(&project_id),
            project_id,
            name: name.into(),
            language: language.into(),
        }
    }
}

pub struct CkgBuilder {
    graph: Arc<dyn GraphBackend>,
    registry: Arc<ParserRegistry>,
    batch_size: usize,
    batch_entity_limit: usize,
    parse_concurrency: usize,
}

impl CkgBuilder {
    pub fn new(
        graph: Arc<dyn GraphBackend>,
        registry: Arc<ParserRegistry>,
        batch_size: usize,
        batch_entity_limit: usize,
        parse_concurrency: usize,
    ) -> Self {
        Self {
            graph,
            registry,
            batch_size: batch_size.max(1),
            batch_entity_limit: batch_entity_limit.max(1),
            parse_concurrency: parse_concurrency.max(1),
        }
    }

    /// Full build of `root` into the project's graph.
    pub async fn build_project(
        &self,
        project: &ProjectDescriptor,
        root: &Path,
        cancel: &CancelToken,
    ) -> Result<BuildStats, BuildError> {
        let files = self.collect_source_files(root)?;
        info!(
            project = %project.graph_id,
            files = files.len(),
            "starting full CKG build"
        );
        self.ensure_project_node(project).await?;

        let mut stats = BuildStats::default();
        let mut pending: Vec<ParsedFile> = Vec::new();
        let mut pending_entities = 0usize;

        for chunk in files.chunks(self.batch_size) {
            cancel.ensure_active()?;
            let parsed_chunk = self.parse_files(root, chunk).await?;
            for parsed in parsed_chunk {
                pending_entities += parsed.entity_count();
                pending.push(parsed);
                if pending.len() >= self.batch_size || pending_entities >= self.batch_entity_limit {
                    cancel.ensure_active()?;
                    let drained = std::mem::take(&mut pending);
                    pending_entities = 0;
                    self.commit_files(project, drained, &mut stats).await?;
                }
            }
        }
        if !pending.is_empty() {
            cancel.ensure_active()?;
            self.commit_files(project, pending, &mut stats).await?;
        }

        info!(
            project = %project.graph_id,
            files = stats.files_processed,
            entities = stats.entities_created,
            unresolved = stats.unresolved_refs,
            placeholders = stats.placeholders_created,
            "full CKG build finished"
        );
        Ok(stats)
    }

    /// Re-parse and re-ingest an explicit set of files; the incremental
    /// updater's entry point.
    pub async fn rebuild_files(
        &self,
        project: &ProjectDescriptor,
        root: &Path,
        paths: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<BuildStats, BuildError> {
        self.ensure_project_node(project).await?;
        let mut stats = BuildStats::default();
        for chunk in paths.chunks(self.batch_size) {
            cancel.ensure_active()?;
            let parsed = self.parse_files(root, chunk).await?;
            self.commit_files(project, parsed, &mut stats).await?;
        }
        Ok(stats)
    }

    /// Re-run cross-file resolution for the given files' symbols without
    /// re-parsing them. Symbolic edge targets are kept as properties on the
    /// source nodes exactly for this: edges into changed files were dropped
    /// by the cascade delete and are re-derived here.
    pub async fn reresolve_files(
        &self,
        project: &ProjectDescriptor,
        paths: &[String],
        stats: &mut BuildStats,
    ) -> Result<(), BuildError> {
        let mut refs: Vec<UnresolvedRef> = Vec::new();
        let functions = self
            .graph
            .nodes_by_kind(NodeKind::Function, &project.graph_id)
            .await?;
        let classes = self
            .graph
            .nodes_by_kind(NodeKind::Class, &project.graph_id)
            .await?;
        for path in paths {
            for function in functions
                .iter()
                .filter(|f| f.str_prop("file_path") == Some(path.as_str()))
            {
                refs.extend(stored_call_refs(function, path));
            }
            for class in classes
                .iter()
                .filter(|c| c.str_prop("file_path") == Some(path.as_str()))
            {
                refs.extend(stored_superclass_refs(class, path));
            }
        }
        self.resolve_refs(project, refs, stats).await
    }

    /// Walk the tree, applying the directory and extension filters.
    pub(crate) fn collect_source_files(&self, root: &Path) -> Result<Vec<PathBuf>, BuildError> {
        let mut out = Vec::new();
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if path.is_dir() {
                    if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref()) {
                        continue;
                    }
                    dirs.push(path);
                    continue;
                }
                if name.starts_with('.') {
                    continue;
                }
                let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
                    continue;
                };
                if self.registry.parser_for_extension(extension).is_some() {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Parse a chunk of files on blocking tasks, bounded by the configured
    /// parse concurrency. A file that fails outright still yields a
    /// `ParsedFile` carrying the error note.
    async fn parse_files(
        &self,
        root: &Path,
        paths: &[PathBuf],
    ) -> Result<Vec<ParsedFile>, BuildError> {
        let semaphore = Arc::new(Semaphore::new(self.parse_concurrency));
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let rel_path = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string();
            let Some(parser) = self.registry.parser_for_extension(&extension) else {
                continue;
            };
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| BuildError::Task(e.to_string()))?;
            let abs_path = path.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let source = match std::fs::read(&abs_path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(path = %rel_path, error = %e, "unreadable file, recording error node");
                        return ParsedFile {
                            path: rel_path,
                            language: parser.language(),
                            content_hash: crate::language::content_hash(&[]),
                            errors: vec![format!("unreadable: {e}")],
                            ..ParsedFile::default()
                        };
                    }
                };
                match parser.parse(&rel_path, &source) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(path = %rel_path, error = %e, "parser failed, recording error node");
                        ParsedFile {
                            path: rel_path,
                            language: parser.language(),
                            content_hash: crate::language::content_hash(&source),
                            size_bytes: source.len() as u64,
                            errors: vec![format!("parse_failed: {e}")],
                            ..ParsedFile::default()
                        }
                    }
                }
            }));
        }
        let mut parsed = Vec::with_capacity(handles.len());
        for handle in handles {
            parsed.push(handle.await.map_err(|e| BuildError::Task(e.to_string()))?);
        }
        Ok(parsed)
    }

    async fn ensure_project_node(&self, project: &ProjectDescriptor) -> Result<(), BuildError> {
        let node = NodeRecord::new(NodeKind::Project, CompositeId::project(&project.graph_id))
            .with("graph_id", project.graph_id.as_str())
            .with("name", project.name.as_str())
            .with("language", project.language.as_str())
            .with("project_id", project.project_id.as_str())
            .with("updated_at", chrono::Utc::now().to_rfc3339());
        self.graph.upsert_node(node).await?;
        Ok(())
    }

    /// Commit one batch of parsed files and resolve their symbolic edges.
    async fn commit_files(
        &self,
        project: &ProjectDescriptor,
        parsed: Vec<ParsedFile>,
        stats: &mut BuildStats,
    ) -> Result<(), BuildError> {
        if parsed.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        let mut refs: Vec<UnresolvedRef> = Vec::new();
        let mut new_class_names: HashSet<String> = HashSet::new();

        for file in &parsed {
            stats.files_processed += 1;
            if !file.errors.is_empty() {
                stats.files_with_errors += 1;
            }
            self.file_into_batch(project, file, &mut batch, &mut refs);
            for class in &file.classes {
                new_class_names.insert(class.name.clone());
            }
        }
        stats.entities_created += batch.entity_count();

        self.apply_with_retry(batch).await?;
        self.replace_placeholders(project, &new_class_names).await?;
        self.resolve_refs(project, refs, stats).await?;
        Ok(())
    }

    /// Apply a batch; retried once on failure before surfacing.
    async fn apply_with_retry(&self, batch: WriteBatch) -> Result<(), BuildError> {
        match self.graph.apply(batch.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, ops = batch.len(), "graph batch failed, retrying once");
                self.graph.apply(batch).await?;
                Ok(())
            }
        }
    }

    /// All node/edge contributions of one parsed file, in dependency order:
    /// the delete of its previous symbols first, then the file node, then
    /// the new symbol set.
    fn file_into_batch(
        &self,
        project: &ProjectDescriptor,
        file: &ParsedFile,
        batch: &mut WriteBatch,
        refs: &mut Vec<UnresolvedRef>,
    ) {
        let graph_id = project.graph_id.as_str();
        let project_id = CompositeId::project(graph_id);
        let file_id = CompositeId::file(graph_id, &file.path);
        let now = chrono::Utc::now().to_rfc3339();

        batch.delete_file_descendants(file_id.clone());

        let file_name = file
            .path
            .rsplit('/')
            .next()
            .unwrap_or(file.path.as_str())
            .to_string();
        batch.upsert_node(
            NodeRecord::new(NodeKind::File, file_id.clone())
                .with("path", file.path.as_str())
                .with("name", file_name)
                .with("project_id", graph_id)
                .with("language", file.language)
                .with("size_bytes", file.size_bytes)
                .with("content_hash", file.content_hash.as_str())
                .with("errors", json!(file.errors))
                .with("updated_at", now.as_str()),
        );
        batch.upsert_edge(EdgeRecord::new(
            EdgeKind::BelongsTo,
            file_id.clone(),
            project_id.clone(),
        ));

        for import in &file.imports {
            let module_id = CompositeId::module(graph_id, &import.module_path);
            let module_name = import
                .module_path
                .rsplit(['.', '/'])
                .next()
                .unwrap_or(import.module_path.as_str())
                .to_string();
            batch.upsert_node(
                NodeRecord::new(NodeKind::Module, module_id.clone())
                    .with("path", import.module_path.as_str())
                    .with("name", module_name)
                    .with("project_id", graph_id),
            );
            batch.upsert_edge(EdgeRecord::new(
                EdgeKind::BelongsTo,
                module_id.clone(),
                project_id.clone(),
            ));
            batch.upsert_edge(
                EdgeRecord::new(EdgeKind::ImportsModule, file_id.clone(), module_id)
                    .with("line", import.line),
            );
        }

        for class in &file.classes {
            let class_id =
                CompositeId::symbol_at(graph_id, &file.path, &class.name, class.start_line);
            batch.upsert_node(
                NodeRecord::new(NodeKind::Class, class_id.clone())
                    .with("name", class.name.as_str())
                    .with("file_path", file.path.as_str())
                    .with("project_id", graph_id)
                    .with("start_line", class.start_line)
                    .with("end_line", class.end_line)
                    .with("placeholder", false)
                    .with("superclass_names", json!(class.superclasses)),
            );
            batch.upsert_edge(EdgeRecord::new(
                EdgeKind::BelongsTo,
                class_id.clone(),
                project_id.clone(),
            ));
            batch.upsert_edge(EdgeRecord::new(
                EdgeKind::DefinedIn,
                class_id.clone(),
                file_id.clone(),
            ));

            for superclass in &class.superclasses {
                refs.push(UnresolvedRef {
                    kind: EdgeKind::InheritsFrom,
                    src: class_id.clone(),
                    src_file: file.path.clone(),
                    target_name: superclass.clone(),
                    hint: SymbolHint::Class,
                    properties: Default::default(),
                });
            }

            for attr in &class.attributes {
                let attr_id = CompositeId::symbol_at(
                    graph_id,
                    &file.path,
                    &format!("{}::{}", class.name, attr.name),
                    attr.line,
                );
                batch.upsert_node(
                    NodeRecord::new(NodeKind::Variable, attr_id.clone())
                        .with("name", attr.name.as_str())
                        .with("file_path", file.path.as_str())
                        .with("project_id", graph_id)
                        .with("scope_type", attr.scope.as_str())
                        .with("line", attr.line),
                );
                batch.upsert_edge(EdgeRecord::new(
                    EdgeKind::BelongsTo,
                    attr_id.clone(),
                    project_id.clone(),
                ));
                batch.upsert_edge(EdgeRecord::new(
                    EdgeKind::DeclaresAttribute,
                    class_id.clone(),
                    attr_id,
                ));
            }

            for decorator in &class.decorators {
                let decorator_id =
                    self.decorator_node(graph_id, decorator, batch, &project_id);
                batch.upsert_edge(EdgeRecord::new(
                    EdgeKind::DecoratedBy,
                    class_id.clone(),
                    decorator_id,
                ));
            }
        }

        for global in &file.globals {
            let var_id =
                CompositeId::symbol_at(graph_id, &file.path, &global.name, global.line);
            batch.upsert_node(
                NodeRecord::new(NodeKind::Variable, var_id.clone())
                    .with("name", global.name.as_str())
                    .with("file_path", file.path.as_str())
                    .with("project_id", graph_id)
                    .with("scope_type", global.scope.as_str())
                    .with("line", global.line),
            );
            batch.upsert_edge(EdgeRecord::new(
                EdgeKind::BelongsTo,
                var_id,
                project_id.clone(),
            ));
        }

        for function in &file.functions {
            let function_id = CompositeId::symbol_at(
                graph_id,
                &file.path,
                &function.name,
                function.start_line,
            );
            let mut node = NodeRecord::new(NodeKind::Function, function_id.clone())
                .with("name", function.name.as_str())
                .with("file_path", file.path.as_str())
                .with("project_id", graph_id)
                .with("signature", function.signature.as_str())
                .with("parameters_str", function.parameters_str.as_str())
                .with("start_line", function.start_line)
                .with("end_line", function.end_line)
                .with("is_method", function.class_name.is_some());
            if let Some(class_name) = &function.class_name {
                node = node.with("class_name", class_name.as_str());
            }
            // Symbolic targets ride along on the node so resolution can
            // re-run for this function without another parse.
            let call_sigs: Vec<serde_json::Value> = function
                .calls
                .iter()
                .map(|c| {
                    json!({
                        "name": c.callee,
                        "line": c.line,
                        "type": c.call_type,
                        "base_object": c.base_object,
                    })
                })
                .collect();
            let creation_sigs: Vec<serde_json::Value> = function
                .creations
                .iter()
                .map(|c| json!({ "name": c.class_name, "line": c.line }))
                .collect();
            node = node
                .with("call_sigs", json!(call_sigs))
                .with("creation_sigs", json!(creation_sigs));
            batch.upsert_node(node);
            batch.upsert_edge(EdgeRecord::new(
                EdgeKind::BelongsTo,
                function_id.clone(),
                project_id.clone(),
            ));
            batch.upsert_edge(EdgeRecord::new(
                EdgeKind::DefinedIn,
                function_id.clone(),
                file_id.clone(),
            ));

            let scope_prefix = match &function.class_name {
                Some(class_name) => format!("{}::{}", class_name, function.name),
                None => function.name.clone(),
            };
            for (variables, edge_kind) in [
                (&function.parameters, EdgeKind::HasParameter),
                (&function.locals, EdgeKind::DeclaresVariable),
            ] {
                for variable in variables.iter() {
                    let var_id = CompositeId::symbol_at(
                        graph_id,
                        &file.path,
                        &format!("{}::{}", scope_prefix, variable.name),
                        variable.line,
                    );
                    batch.upsert_node(
                        NodeRecord::new(NodeKind::Variable, var_id.clone())
                            .with("name", variable.name.as_str())
                            .with("file_path", file.path.as_str())
                            .with("project_id", graph_id)
                            .with("scope_type", variable.scope.as_str())
                            .with("line", variable.line),
                    );
                    batch.upsert_edge(EdgeRecord::new(
                        EdgeKind::BelongsTo,
                        var_id.clone(),
                        project_id.clone(),
                    ));
                    batch.upsert_edge(EdgeRecord::new(edge_kind, function_id.clone(), var_id));
                }
            }

            // Variable use/write edges stay file-local: the target is looked
            // up among this function's own declarations or the file globals.
            for usage in &function.uses {
                if let Some(var_id) = local_variable_id(
                    graph_id,
                    file,
                    function,
                    &scope_prefix,
                    &usage.name,
                ) {
                    batch.upsert_edge(
                        EdgeRecord::new(EdgeKind::UsesVariable, function_id.clone(), var_id)
                            .with("usage_line", usage.line),
                    );
                }
            }
            for write in &function.writes {
                if let Some(var_id) = local_variable_id(
                    graph_id,
                    file,
                    function,
                    &scope_prefix,
                    &write.name,
                ) {
                    batch.upsert_edge(
                        EdgeRecord::new(EdgeKind::ModifiesVariable, function_id.clone(), var_id)
                            .with("modification_line", write.line)
                            .with("modification_type", write.modification_type.as_str()),
                    );
                }
            }

            for exception in &function.raises {
                let exc_id = self.exception_node(graph_id, exception, batch, &project_id);
                batch.upsert_edge(EdgeRecord::new(
                    EdgeKind::RaisesException,
                    function_id.clone(),
                    exc_id,
                ));
            }
            for exception in &function.handles {
                let exc_id = self.exception_node(graph_id, exception, batch, &project_id);
                batch.upsert_edge(EdgeRecord::new(
                    EdgeKind::HandlesException,
                    function_id.clone(),
                    exc_id,
                ));
            }
            for decorator in &function.decorators {
                let decorator_id = self.decorator_node(graph_id, decorator, batch, &project_id);
                batch.upsert_edge(EdgeRecord::new(
                    EdgeKind::DecoratedBy,
                    function_id.clone(),
                    decorator_id,
                ));
            }

            for call in &function.calls {
                let mut properties = serde_json::Map::new();
                properties.insert("call_site_line".into(), json!(call.line));
                properties.insert("type".into(), json!(call.call_type));
                if let Some(base) = &call.base_object {
                    properties.insert("base_object".into(), json!(base));
                }
                refs.push(UnresolvedRef {
                    kind: EdgeKind::Calls,
                    src: function_id.clone(),
                    src_file: file.path.clone(),
                    target_name: call.callee.clone(),
                    hint: SymbolHint::Function,
                    properties,
                });
            }
            for creation in &function.creations {
                let mut properties = serde_json::Map::new();
                properties.insert("creation_line".into(), json!(creation.line));
                refs.push(UnresolvedRef {
                    kind: EdgeKind::CreatesObject,
                    src: function_id.clone(),
                    src_file: file.path.clone(),
                    target_name: creation.class_name.clone(),
                    hint: SymbolHint::Class,
                    properties,
                });
            }
        }
    }

    fn decorator_node(
        &self,
        graph_id: &str,
        name: &str,
        batch: &mut WriteBatch,
        project_id: &CompositeId,
    ) -> CompositeId {
        let id = CompositeId::decorator(graph_id, name);
        batch.upsert_node(
            NodeRecord::new(NodeKind::Decorator, id.clone())
                .with("name", name)
                .with("project_id", graph_id),
        );
        batch.upsert_edge(EdgeRecord::new(
            EdgeKind::BelongsTo,
            id.clone(),
            project_id.clone(),
        ));
        id
    }

    fn exception_node(
        &self,
        graph_id: &str,
        name: &str,
        batch: &mut WriteBatch,
        project_id: &CompositeId,
    ) -> CompositeId {
        let id = CompositeId::exception(graph_id, name);
        batch.upsert_node(
            NodeRecord::new(NodeKind::ExceptionType, id.clone())
                .with("name", name)
                .with("project_id", graph_id),
        );
        batch.upsert_edge(EdgeRecord::new(
            EdgeKind::BelongsTo,
            id.clone(),
            project_id.clone(),
        ));
        id
    }

    /// Rewire edges from placeholders whose real class just landed, then
    /// drop the placeholder nodes.
    async fn replace_placeholders(
        &self,
        project: &ProjectDescriptor,
        class_names: &HashSet<String>,
    ) -> Result<(), BuildError> {
        for name in class_names {
            let placeholder_id = CompositeId::placeholder(&project.graph_id, name);
            if self.graph.get_node(&placeholder_id).await?.is_none() {
                continue;
            }
            let replacements = self
                .graph
                .nodes_by_name(NodeKind::Class, &project.graph_id, name)
                .await?;
            let Some(real) = replacements
                .iter()
                .filter(|c| !c.bool_prop("placeholder"))
                .min_by(|a, b| a.id.cmp(&b.id))
            else {
                continue;
            };
            let incoming = self.graph.edges_to(&placeholder_id, None).await?;
            debug!(
                placeholder = %placeholder_id,
                real = %real.id,
                edges = incoming.len(),
                "replacing placeholder class"
            );
            for edge in incoming {
                if edge.kind == EdgeKind::BelongsTo {
                    continue;
                }
                let mut rewired = EdgeRecord::new(edge.kind, edge.src, real.id.clone());
                rewired.properties = edge.properties;
                self.graph.upsert_edge(rewired).await?;
            }
            self.graph.delete_node(&placeholder_id).await?;
        }
        Ok(())
    }

    /// Cross-file resolution for a batch's symbolic edges.
    async fn resolve_refs(
        &self,
        project: &ProjectDescriptor,
        refs: Vec<UnresolvedRef>,
        stats: &mut BuildStats,
    ) -> Result<(), BuildError> {
        if refs.is_empty() {
            return Ok(());
        }
        let graph_id = project.graph_id.as_str();
        let project_node = CompositeId::project(graph_id);
        let mut batch = WriteBatch::new();

        for unresolved in refs {
            let target = self
                .lookup_symbol(graph_id, &unresolved)
                .await?;
            match target {
                Some((target_id, target_kind)) => {
                    // A call whose name resolved to a class is a constructor
                    // invocation; the edge changes kind accordingly.
                    let kind = if unresolved.kind == EdgeKind::Calls
                        && target_kind == NodeKind::Class
                    {
                        EdgeKind::CreatesObject
                    } else {
                        unresolved.kind
                    };
                    let mut edge = EdgeRecord::new(kind, unresolved.src, target_id);
                    edge.properties = unresolved.properties;
                    if kind == EdgeKind::CreatesObject {
                        if let Some(line) = edge.properties.remove("call_site_line") {
                            edge.properties.insert("creation_line".into(), line);
                        }
                        edge.properties.remove("type");
                    }
                    batch.upsert_edge(edge);
                }
                None => match unresolved.hint {
                    // Inheritance and creation edges cannot be dropped; a
                    // placeholder class stands in until the target is parsed.
                    SymbolHint::Class => {
                        let placeholder_id =
                            CompositeId::placeholder(graph_id, &unresolved.target_name);
                        batch.upsert_node(
                            NodeRecord::new(NodeKind::Class, placeholder_id.clone())
                                .with("name", unresolved.target_name.as_str())
                                .with("file_path", "")
                                .with("project_id", graph_id)
                                .with("placeholder", true),
                        );
                        batch.upsert_edge(EdgeRecord::new(
                            EdgeKind::BelongsTo,
                            placeholder_id.clone(),
                            project_node.clone(),
                        ));
                        let mut edge =
                            EdgeRecord::new(unresolved.kind, unresolved.src, placeholder_id);
                        edge.properties = unresolved.properties;
                        batch.upsert_edge(edge);
                        stats.placeholders_created += 1;
                    }
                    _ => {
                        stats.unresolved_refs += 1;
                    }
                },
            }
        }

        if !batch.is_empty() {
            self.apply_with_retry(batch).await?;
        }
        Ok(())
    }

    /// Symbol index lookup: same-file candidates win, then any project-wide
    /// match, ordered by composite id for determinism. A call whose name
    /// resolves to a class instead of a function becomes a creation edge
    /// target (constructor-call languages have no `new` keyword).
    async fn lookup_symbol(
        &self,
        graph_id: &str,
        unresolved: &UnresolvedRef,
    ) -> Result<Option<(CompositeId, NodeKind)>, BuildError> {
        let primary_kind = unresolved.hint.node_kind();
        if let Some(id) = self.pick_candidate(primary_kind, graph_id, unresolved).await? {
            return Ok(Some((id, primary_kind)));
        }
        if unresolved.hint == SymbolHint::Function {
            if let Some(id) = self
                .pick_candidate(NodeKind::Class, graph_id, unresolved)
                .await?
            {
                return Ok(Some((id, NodeKind::Class)));
            }
        }
        Ok(None)
    }

    async fn pick_candidate(
        &self,
        kind: NodeKind,
        graph_id: &str,
        unresolved: &UnresolvedRef,
    ) -> Result<Option<CompositeId>, BuildError> {
        let mut candidates = self
            .graph
            .nodes_by_name(kind, graph_id, &unresolved.target_name)
            .await?;
        candidates.retain(|c| !c.bool_prop("placeholder") && c.id != unresolved.src);
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let same_file = candidates
            .iter()
            .find(|c| c.str_prop("file_path") == Some(unresolved.src_file.as_str()));
        Ok(Some(
            same_file.unwrap_or(&candidates[0]).id.clone(),
        ))
    }
}

/// Symbolic call and creation descriptors stored on a function node, turned
/// back into unresolved refs for a resolution re-run.
fn stored_call_refs(function: &NodeRecord, path: &str) -> Vec<UnresolvedRef> {
    let mut refs = Vec::new();
    if let Some(calls) = function.properties.get("call_sigs").and_then(|v| v.as_array()) {
        for call in calls {
            let Some(name) = call.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut properties = serde_json::Map::new();
            if let Some(line) = call.get("line") {
                properties.insert("call_site_line".into(), line.clone());
            }
            if let Some(call_type) = call.get("type") {
                properties.insert("type".into(), call_type.clone());
            }
            if let Some(base) = call.get("base_object").filter(|v| !v.is_null()) {
                properties.insert("base_object".into(), base.clone());
            }
            refs.push(UnresolvedRef {
                kind: EdgeKind::Calls,
                src: function.id.clone(),
                src_file: path.to_string(),
                target_name: name.to_string(),
                hint: SymbolHint::Function,
                properties,
            });
        }
    }
    if let Some(creations) = function
        .properties
        .get("creation_sigs")
        .and_then(|v| v.as_array())
    {
        for creation in creations {
            let Some(name) = creation.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut properties = serde_json::Map::new();
            if let Some(line) = creation.get("line") {
                properties.insert("creation_line".into(), line.clone());
            }
            refs.push(UnresolvedRef {
                kind: EdgeKind::CreatesObject,
                src: function.id.clone(),
                src_file: path.to_string(),
                target_name: name.to_string(),
                hint: SymbolHint::Class,
                properties,
            });
        }
    }
    refs
}

/// Superclass names stored on a class node, turned back into unresolved
/// inheritance refs.
fn stored_superclass_refs(class: &NodeRecord, path: &str) -> Vec<UnresolvedRef> {
    let Some(names) = class
        .properties
        .get("superclass_names")
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|v| v.as_str())
        .map(|name| UnresolvedRef {
            kind: EdgeKind::InheritsFrom,
            src: class.id.clone(),
            src_file: path.to_string(),
            target_name: name.to_string(),
            hint: SymbolHint::Class,
            properties: Default::default(),
        })
        .collect()
}

/// Composite id of a variable referenced from `function`, looked up among its
/// parameters, locals, and the file's globals.
fn local_variable_id(
    graph_id: &str,
    file: &ParsedFile,
    function: &crate::language::ExtractedFunction,
    scope_prefix: &str,
    name: &str,
) -> Option<CompositeId> {
    if let Some(variable) = function
        .parameters
        .iter()
        .chain(function.locals.iter())
        .find(|v| v.name == name)
    {
        return Some(CompositeId::symbol_at(
            graph_id,
            &file.path,
            &format!("{scope_prefix}::{name}"),
            variable.line,
        ));
    }
    file.globals.iter().find(|g| g.name == name).map(|global| {
        CompositeId::symbol_at(graph_id, &file.path, &global.name, global.line)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::MemoryGraph;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn builder(graph: Arc<dyn GraphBackend>) -> CkgBuilder {
        let registry = Arc::new(ParserRegistry::with_builtin_languages(1_048_576).unwrap());
        CkgBuilder::new(graph, registry, 50, 10_000, 4)
    }

    #[tokio::test]
    async fn full_build_creates_expected_nodes_and_edges() {
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let dir = fixture(&[
            (
                "a.py",
                "class Alpha:\n    def run(self):\n        helper()\n",
            ),
            ("b.py", "def helper():\n    return 1\n"),
        ]);
        let project = ProjectDescriptor::new("1", "demo", "python");
        let stats = builder(Arc::clone(&graph))
            .build_project(&project, dir.path(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(stats.files_processed, 2);
        let files = graph
            .nodes_by_kind(NodeKind::File, &project.graph_id)
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
        let functions = graph
            .nodes_by_kind(NodeKind::Function, &project.graph_id)
            .await
            .unwrap();
        assert_eq!(functions.len(), 2);

        // The cross-file call from Alpha.run resolved to helper in b.py.
        let run = functions
            .iter()
            .find(|f| f.str_prop("name") == Some("run"))
            .unwrap();
        let calls = graph.edges_from(&run.id, Some(EdgeKind::Calls)).await.unwrap();
        assert_eq!(calls.len(), 1);
        let callee = graph.get_node(&calls[0].dst).await.unwrap().unwrap();
        assert_eq!(callee.str_prop("name"), Some("helper"));
    }

    #[tokio::test]
    async fn unresolved_superclass_becomes_placeholder_then_is_replaced() {
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let project = ProjectDescriptor::new("1", "demo", "python");
        let ckg = builder(Arc::clone(&graph));

        let dir = fixture(&[("child.py", "class Child(Base):\n    pass\n")]);
        let stats = ckg
            .build_project(&project, dir.path(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(stats.placeholders_created, 1);

        let placeholder_id = CompositeId::placeholder(&project.graph_id, "Base");
        let placeholder = graph.get_node(&placeholder_id).await.unwrap().unwrap();
        assert!(placeholder.bool_prop("placeholder"));

        // Parsing the real Base replaces the placeholder and rewires the
        // inheritance edge.
        let dir2 = fixture(&[("base.py", "class Base:\n    pass\n")]);
        ckg.rebuild_files(
            &project,
            dir2.path(),
            &[dir2.path().join("base.py")],
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert!(graph.get_node(&placeholder_id).await.unwrap().is_none());
        let classes = graph
            .nodes_by_name(NodeKind::Class, &project.graph_id, "Child")
            .await
            .unwrap();
        let inherits = graph
            .edges_from(&classes[0].id, Some(EdgeKind::InheritsFrom))
            .await
            .unwrap();
        assert_eq!(inherits.len(), 1);
        let target = graph.get_node(&inherits[0].dst).await.unwrap().unwrap();
        assert_eq!(target.str_prop("name"), Some("Base"));
        assert!(!target.bool_prop("placeholder"));
    }

    #[tokio::test]
    async fn parser_failures_do_not_abort_the_build() {
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let dir = fixture(&[
            ("ok.py", "def fine():\n    pass\n"),
            ("broken.py", "def broken(:\n"),
        ]);
        let project = ProjectDescriptor::new("1", "demo", "python");
        let stats = builder(Arc::clone(&graph))
            .build_project(&project, dir.path(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.files_with_errors, 1);
        // Both files still have nodes.
        let files = graph
            .nodes_by_kind(NodeKind::File, &project.graph_id)
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let dir = fixture(&[("a.py", "x = 1\n"), ("b.py", "y = 2\n")]);
        let project = ProjectDescriptor::new("1", "demo", "python");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = builder(graph)
            .build_project(&project, dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Canceled(_)));
    }
}
