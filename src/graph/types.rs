//! Core graph records
//!
//! Node/edge kinds, composite identifiers, and the batch structures the
//! builder hands to a [`GraphBackend`](crate::graph::store::GraphBackend).
//! Properties are schemaless JSON bags; the typed enums carry everything the
//! store needs for indexing and cascade semantics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Deterministic node identifier:
/// `{project}:{file_path}[:{symbol_name}[:{start_line}]]`.
///
/// Stable across re-parses, which is what makes upserts idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeId(String);

impl CompositeId {
    pub fn project(project_graph_id: &str) -> Self {
        Self(project_graph_id.to_string())
    }

    pub fn file(project_graph_id: &str, path: &str) -> Self {
        Self(format!("{project_graph_id}:{path}"))
    }

    /// For symbols unique per file by name (modules, decorators).
    pub fn symbol(project_graph_id: &str, path: &str, name: &str) -> Self {
        Self(format!("{project_graph_id}:{path}:{name}"))
    }

    /// For symbols disambiguated by their definition line.
    pub fn symbol_at(project_graph_id: &str, path: &str, name: &str, start_line: u32) -> Self {
        Self(format!("{project_graph_id}:{path}:{name}:{start_line}"))
    }

    /// Placeholder classes have no defining file yet; they are keyed by name
    /// alone so a later real definition can be found by resolution, not by id.
    pub fn placeholder(project_graph_id: &str, name: &str) -> Self {
        Self(format!("{project_graph_id}:__unresolved__:{name}"))
    }

    /// Modules are project-wide namespaces, not file descendants.
    pub fn module(project_graph_id: &str, module_path: &str) -> Self {
        Self(format!("{project_graph_id}:__module__:{module_path}"))
    }

    /// Exception types are shared across the project.
    pub fn exception(project_graph_id: &str, name: &str) -> Self {
        Self(format!("{project_graph_id}:__exception__:{name}"))
    }

    /// Decorators are shared across the project.
    pub fn decorator(project_graph_id: &str, name: &str) -> Self {
        Self(format!("{project_graph_id}:__decorator__:{name}"))
    }

    /// Wrap an id string read back from a backend.
    pub fn raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this id belongs to the file or one of its symbols.
    pub fn is_under_file(&self, file_id: &CompositeId) -> bool {
        self.0 == file_id.0 || self.0.starts_with(&format!("{}:", file_id.0))
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tagged node variants of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Project,
    File,
    Module,
    Class,
    Function,
    Variable,
    Decorator,
    ExceptionType,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Project => "Project",
            NodeKind::File => "File",
            NodeKind::Module => "Module",
            NodeKind::Class => "Class",
            NodeKind::Function => "Function",
            NodeKind::Variable => "Variable",
            NodeKind::Decorator => "Decorator",
            NodeKind::ExceptionType => "ExceptionType",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == label)
    }

    pub const ALL: [NodeKind; 8] = [
        NodeKind::Project,
        NodeKind::File,
        NodeKind::Module,
        NodeKind::Class,
        NodeKind::Function,
        NodeKind::Variable,
        NodeKind::Decorator,
        NodeKind::ExceptionType,
    ];
}

/// Directed edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    BelongsTo,
    DefinedIn,
    HasParameter,
    DeclaresVariable,
    DeclaresAttribute,
    Calls,
    InheritsFrom,
    UsesVariable,
    ModifiesVariable,
    CreatesObject,
    RaisesException,
    HandlesException,
    DecoratedBy,
    ImportsModule,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 14] = [
        EdgeKind::BelongsTo,
        EdgeKind::DefinedIn,
        EdgeKind::HasParameter,
        EdgeKind::DeclaresVariable,
        EdgeKind::DeclaresAttribute,
        EdgeKind::Calls,
        EdgeKind::InheritsFrom,
        EdgeKind::UsesVariable,
        EdgeKind::ModifiesVariable,
        EdgeKind::CreatesObject,
        EdgeKind::RaisesException,
        EdgeKind::HandlesException,
        EdgeKind::DecoratedBy,
        EdgeKind::ImportsModule,
    ];

    pub fn from_type(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::BelongsTo => "BELONGS_TO",
            EdgeKind::DefinedIn => "DEFINED_IN",
            EdgeKind::HasParameter => "HAS_PARAMETER",
            EdgeKind::DeclaresVariable => "DECLARES_VARIABLE",
            EdgeKind::DeclaresAttribute => "DECLARES_ATTRIBUTE",
            EdgeKind::Calls => "CALLS",
            EdgeKind::InheritsFrom => "INHERITS_FROM",
            EdgeKind::UsesVariable => "USES_VARIABLE",
            EdgeKind::ModifiesVariable => "MODIFIES_VARIABLE",
            EdgeKind::CreatesObject => "CREATES_OBJECT",
            EdgeKind::RaisesException => "RAISES_EXCEPTION",
            EdgeKind::HandlesException => "HANDLES_EXCEPTION",
            EdgeKind::DecoratedBy => "DECORATED_BY",
            EdgeKind::ImportsModule => "IMPORTS_MODULE",
        }
    }
}

/// Scope classification assigned to variables at declaration site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Parameter,
    LocalVariable,
    GlobalVariable,
    ClassAttribute,
}

impl ScopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeType::Parameter => "parameter",
            ScopeType::LocalVariable => "local_variable",
            ScopeType::GlobalVariable => "global_variable",
            ScopeType::ClassAttribute => "class_attribute",
        }
    }
}

/// A node plus its property bag, ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub id: CompositeId,
    pub properties: Map<String, Value>,
}

impl NodeRecord {
    pub fn new(kind: NodeKind, id: CompositeId) -> Self {
        Self {
            kind,
            id,
            properties: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn str_prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn u64_prop(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(Value::as_u64)
    }

    pub fn bool_prop(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A directed edge plus its property bag. Identity is `(kind, src, dst)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub kind: EdgeKind,
    pub src: CompositeId,
    pub dst: CompositeId,
    pub properties: Map<String, Value>,
}

impl EdgeRecord {
    pub fn new(kind: EdgeKind, src: CompositeId, dst: CompositeId) -> Self {
        Self {
            kind,
            src,
            dst,
            properties: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Hint attached to an unresolved edge target, narrowing the symbol index
/// lookup during cross-file resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolHint {
    Class,
    Function,
    ExceptionType,
}

impl SymbolHint {
    pub fn node_kind(self) -> NodeKind {
        match self {
            SymbolHint::Class => NodeKind::Class,
            SymbolHint::Function => NodeKind::Function,
            SymbolHint::ExceptionType => NodeKind::ExceptionType,
        }
    }
}

/// An edge whose target is known only by name; resolution happens in a second
/// pass against the project symbol index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedRef {
    pub kind: EdgeKind,
    pub src: CompositeId,
    /// File the source symbol lives in; same-file targets win resolution.
    pub src_file: String,
    pub target_name: String,
    pub hint: SymbolHint,
    pub properties: Map<String, Value>,
}

/// One operation within an atomic write batch. Order matters: the builder
/// emits `Project` and `File` upserts before anything referencing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOp {
    UpsertNode(NodeRecord),
    UpsertEdge(EdgeRecord),
    /// Cascading delete of a file node and every symbol defined in it.
    DeleteFileDescendants(CompositeId),
}

/// Ordered operations applied as one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_node(&mut self, node: NodeRecord) {
        self.ops.push(BatchOp::UpsertNode(node));
    }

    pub fn upsert_edge(&mut self, edge: EdgeRecord) {
        self.ops.push(BatchOp::UpsertEdge(edge));
    }

    pub fn delete_file_descendants(&mut self, file_id: CompositeId) {
        self.ops.push(BatchOp::DeleteFileDescendants(file_id));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Entities (node upserts) carried by this batch; drives the early-flush
    /// ceiling.
    pub fn entity_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, BatchOp::UpsertNode(_)))
            .count()
    }
}

/// Counters emitted by a full build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub files_processed: usize,
    pub files_with_errors: usize,
    pub entities_created: usize,
    pub unresolved_refs: usize,
    pub placeholders_created: usize,
}

/// Counters emitted by an incremental update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub affected_unchanged: usize,
    pub total_updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_ids_are_deterministic() {
        let a = CompositeId::symbol_at("vigil_project_1", "src/app.py", "main", 10);
        let b = CompositeId::symbol_at("vigil_project_1", "src/app.py", "main", 10);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "vigil_project_1:src/app.py:main:10");
    }

    #[test]
    fn id_prefix_scopes_descendants() {
        let file = CompositeId::file("p", "src/a.py");
        let symbol = CompositeId::symbol_at("p", "src/a.py", "f", 3);
        let other = CompositeId::file("p", "src/a.python");
        assert!(symbol.is_under_file(&file));
        assert!(file.is_under_file(&file));
        assert!(!other.is_under_file(&file));
    }

    #[test]
    fn batch_entity_count_ignores_edges_and_deletes() {
        let mut batch = WriteBatch::new();
        let id = CompositeId::file("p", "a.py");
        batch.upsert_node(NodeRecord::new(NodeKind::File, id.clone()));
        batch.upsert_edge(EdgeRecord::new(
            EdgeKind::BelongsTo,
            id.clone(),
            CompositeId::project("p"),
        ));
        batch.delete_file_descendants(id);
        assert_eq!(batch.entity_count(), 1);
        assert_eq!(batch.len(), 3);
    }
}
