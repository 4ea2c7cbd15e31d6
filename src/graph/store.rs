//! Graph store abstraction
//!
//! The [`GraphBackend`] trait is the only write/read surface the rest of the
//! pipeline sees; no query language leaks to callers. Writes are grouped into
//! [`WriteBatch`]es applied atomically. Uniqueness of composite ids per kind
//! is enforced here: an upsert onto an existing node merges properties
//! shallowly (arrays replaced) instead of failing.
//!
//! Two backends exist: [`MemoryGraph`] (in-process, indexed, the default and
//! the test substrate) and the HTTP backend in
//! [`http_store`](crate::graph::http_store) speaking the graph server's
//! transactional endpoint.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

use super::types::{
    BatchOp, CompositeId, EdgeKind, EdgeRecord, NodeKind, NodeRecord, WriteBatch,
};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contract violation: {message}")]
    ContractViolation { message: String },

    #[error("node not found: {id}")]
    MissingNode { id: String },

    #[error("composite id {id} already exists with kind {existing}, upsert had kind {requested}")]
    KindMismatch {
        id: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("project lease for {project} held by {holder}")]
    LeaseHeld { project: String, holder: String },

    #[error("graph transport error: {0}")]
    Transport(String),

    #[error("graph backend error: {0}")]
    Backend(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Aggregate counts used by validation and the summary queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub nodes: usize,
    pub edges: usize,
}

/// Backend-agnostic property-graph interface.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Upsert a single node; merge-on-conflict per the store contract.
    async fn upsert_node(&self, node: NodeRecord) -> GraphResult<()>;

    /// Upsert a single edge keyed by `(kind, src, dst)`. Both endpoints must
    /// already exist.
    async fn upsert_edge(&self, edge: EdgeRecord) -> GraphResult<()>;

    /// Apply a batch atomically: either every operation lands or none does.
    async fn apply(&self, batch: WriteBatch) -> GraphResult<()>;

    /// Cascading delete of a file node and every symbol defined in it,
    /// including edges from other files into the deleted symbols.
    async fn delete_file_and_descendants(&self, file_id: &CompositeId) -> GraphResult<()>;

    /// Delete a single node and its incident edges. Used when a placeholder
    /// is replaced by the real definition.
    async fn delete_node(&self, id: &CompositeId) -> GraphResult<()>;

    async fn get_node(&self, id: &CompositeId) -> GraphResult<Option<NodeRecord>>;

    /// All nodes of a kind owned by a project, ordered by composite id.
    async fn nodes_by_kind(
        &self,
        kind: NodeKind,
        project_graph_id: &str,
    ) -> GraphResult<Vec<NodeRecord>>;

    /// Nodes of a kind matching `name` exactly within a project.
    async fn nodes_by_name(
        &self,
        kind: NodeKind,
        project_graph_id: &str,
        name: &str,
    ) -> GraphResult<Vec<NodeRecord>>;

    /// Outgoing edges of a node, optionally restricted to one kind.
    async fn edges_from(
        &self,
        src: &CompositeId,
        kind: Option<EdgeKind>,
    ) -> GraphResult<Vec<EdgeRecord>>;

    /// Incoming edges of a node, optionally restricted to one kind.
    async fn edges_to(
        &self,
        dst: &CompositeId,
        kind: Option<EdgeKind>,
    ) -> GraphResult<Vec<EdgeRecord>>;

    /// All edges of a kind whose source belongs to the project.
    async fn edges_by_kind(
        &self,
        kind: EdgeKind,
        project_graph_id: &str,
    ) -> GraphResult<Vec<EdgeRecord>>;

    /// `(path, content_hash)` for every file node of the project; the change
    /// detector's working set.
    async fn file_hashes(&self, project_graph_id: &str) -> GraphResult<Vec<(String, String)>>;

    async fn counts(&self, project_graph_id: &str) -> GraphResult<GraphCounts>;

    /// Per-project mutation lease. Serializes graph writers for one project
    /// across workers; re-acquisition by the same owner succeeds.
    async fn try_acquire_lease(&self, project_graph_id: &str, owner: &str) -> GraphResult<()>;

    async fn release_lease(&self, project_graph_id: &str, owner: &str) -> GraphResult<()>;
}

type EdgeKey = (EdgeKind, CompositeId, CompositeId);

#[derive(Debug, Default, Clone)]
struct MemoryState {
    nodes: HashMap<CompositeId, NodeRecord>,
    by_kind: HashMap<NodeKind, BTreeSet<CompositeId>>,
    edges: HashMap<EdgeKey, EdgeRecord>,
    out_edges: HashMap<CompositeId, BTreeSet<EdgeKey>>,
    in_edges: HashMap<CompositeId, BTreeSet<EdgeKey>>,
    leases: HashMap<String, String>,
}

impl MemoryState {
    fn upsert_node(&mut self, node: NodeRecord) -> GraphResult<()> {
        match self.nodes.get_mut(&node.id) {
            Some(existing) => {
                if existing.kind != node.kind {
                    return Err(GraphError::KindMismatch {
                        id: node.id.to_string(),
                        existing: existing.kind.as_str(),
                        requested: node.kind.as_str(),
                    });
                }
                // Shallow merge: incoming keys win, arrays are replaced whole.
                for (key, value) in node.properties {
                    existing.properties.insert(key, value);
                }
            }
            None => {
                self.by_kind
                    .entry(node.kind)
                    .or_default()
                    .insert(node.id.clone());
                self.nodes.insert(node.id.clone(), node);
            }
        }
        Ok(())
    }

    fn upsert_edge(&mut self, edge: EdgeRecord) -> GraphResult<()> {
        if !self.nodes.contains_key(&edge.src) {
            return Err(GraphError::MissingNode {
                id: edge.src.to_string(),
            });
        }
        if !self.nodes.contains_key(&edge.dst) {
            return Err(GraphError::MissingNode {
                id: edge.dst.to_string(),
            });
        }
        let key: EdgeKey = (edge.kind, edge.src.clone(), edge.dst.clone());
        match self.edges.get_mut(&key) {
            Some(existing) => {
                for (k, v) in edge.properties {
                    existing.properties.insert(k, v);
                }
            }
            None => {
                self.out_edges
                    .entry(edge.src.clone())
                    .or_default()
                    .insert(key.clone());
                self.in_edges
                    .entry(edge.dst.clone())
                    .or_default()
                    .insert(key.clone());
                self.edges.insert(key, edge);
            }
        }
        Ok(())
    }

    fn remove_node(&mut self, id: &CompositeId) {
        if let Some(node) = self.nodes.remove(id) {
            if let Some(set) = self.by_kind.get_mut(&node.kind) {
                set.remove(id);
            }
        }
        let mut stale: Vec<EdgeKey> = Vec::new();
        if let Some(keys) = self.out_edges.remove(id) {
            stale.extend(keys);
        }
        if let Some(keys) = self.in_edges.remove(id) {
            stale.extend(keys);
        }
        for key in stale {
            self.edges.remove(&key);
            if let Some(set) = self.out_edges.get_mut(&key.1) {
                set.remove(&key);
            }
            if let Some(set) = self.in_edges.get_mut(&key.2) {
                set.remove(&key);
            }
        }
    }

    fn delete_file_and_descendants(&mut self, file_id: &CompositeId) {
        let doomed: Vec<CompositeId> = self
            .nodes
            .keys()
            .filter(|id| id.is_under_file(file_id))
            .cloned()
            .collect();
        for id in doomed {
            self.remove_node(&id);
        }
    }

    fn apply_op(&mut self, op: BatchOp) -> GraphResult<()> {
        match op {
            BatchOp::UpsertNode(node) => self.upsert_node(node),
            BatchOp::UpsertEdge(edge) => self.upsert_edge(edge),
            BatchOp::DeleteFileDescendants(file_id) => {
                self.delete_file_and_descendants(&file_id);
                Ok(())
            }
        }
    }
}

/// In-process graph backend with the index set the spec requires, behind a
/// single `RwLock`. Batches are applied to a copy of the state and swapped in
/// on success, which is what makes them atomic.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: RwLock<MemoryState>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphBackend for MemoryGraph {
    async fn upsert_node(&self, node: NodeRecord) -> GraphResult<()> {
        self.state.write().await.upsert_node(node)
    }

    async fn upsert_edge(&self, edge: EdgeRecord) -> GraphResult<()> {
        self.state.write().await.upsert_edge(edge)
    }

    async fn apply(&self, batch: WriteBatch) -> GraphResult<()> {
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        for op in batch.ops {
            staged.apply_op(op)?;
        }
        *state = staged;
        Ok(())
    }

    async fn delete_file_and_descendants(&self, file_id: &CompositeId) -> GraphResult<()> {
        self.state
            .write()
            .await
            .delete_file_and_descendants(file_id);
        Ok(())
    }

    async fn delete_node(&self, id: &CompositeId) -> GraphResult<()> {
        self.state.write().await.remove_node(id);
        Ok(())
    }

    async fn get_node(&self, id: &CompositeId) -> GraphResult<Option<NodeRecord>> {
        Ok(self.state.read().await.nodes.get(id).cloned())
    }

    async fn nodes_by_kind(
        &self,
        kind: NodeKind,
        project_graph_id: &str,
    ) -> GraphResult<Vec<NodeRecord>> {
        let state = self.state.read().await;
        let prefix = format!("{project_graph_id}:");
        let mut out = Vec::new();
        if let Some(ids) = state.by_kind.get(&kind) {
            for id in ids {
                if id.as_str() == project_graph_id || id.as_str().starts_with(&prefix) {
                    if let Some(node) = state.nodes.get(id) {
                        out.push(node.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn nodes_by_name(
        &self,
        kind: NodeKind,
        project_graph_id: &str,
        name: &str,
    ) -> GraphResult<Vec<NodeRecord>> {
        let all = self.nodes_by_kind(kind, project_graph_id).await?;
        Ok(all
            .into_iter()
            .filter(|node| node.str_prop("name") == Some(name))
            .collect())
    }

    async fn edges_from(
        &self,
        src: &CompositeId,
        kind: Option<EdgeKind>,
    ) -> GraphResult<Vec<EdgeRecord>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        if let Some(keys) = state.out_edges.get(src) {
            for key in keys {
                if kind.map_or(true, |k| k == key.0) {
                    if let Some(edge) = state.edges.get(key) {
                        out.push(edge.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn edges_to(
        &self,
        dst: &CompositeId,
        kind: Option<EdgeKind>,
    ) -> GraphResult<Vec<EdgeRecord>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        if let Some(keys) = state.in_edges.get(dst) {
            for key in keys {
                if kind.map_or(true, |k| k == key.0) {
                    if let Some(edge) = state.edges.get(key) {
                        out.push(edge.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn edges_by_kind(
        &self,
        kind: EdgeKind,
        project_graph_id: &str,
    ) -> GraphResult<Vec<EdgeRecord>> {
        let state = self.state.read().await;
        let prefix = format!("{project_graph_id}:");
        Ok(state
            .edges
            .values()
            .filter(|edge| {
                edge.kind == kind
                    && (edge.src.as_str() == project_graph_id
                        || edge.src.as_str().starts_with(&prefix))
            })
            .cloned()
            .collect())
    }

    async fn file_hashes(&self, project_graph_id: &str) -> GraphResult<Vec<(String, String)>> {
        let files = self.nodes_by_kind(NodeKind::File, project_graph_id).await?;
        Ok(files
            .iter()
            .filter_map(|file| {
                let path = file.str_prop("path")?.to_string();
                let hash = file.str_prop("content_hash")?.to_string();
                Some((path, hash))
            })
            .collect())
    }

    async fn counts(&self, project_graph_id: &str) -> GraphResult<GraphCounts> {
        let state = self.state.read().await;
        let prefix = format!("{project_graph_id}:");
        let in_project = |id: &CompositeId| {
            id.as_str() == project_graph_id || id.as_str().starts_with(&prefix)
        };
        Ok(GraphCounts {
            nodes: state.nodes.keys().filter(|id| in_project(id)).count(),
            edges: state.edges.values().filter(|e| in_project(&e.src)).count(),
        })
    }

    async fn try_acquire_lease(&self, project_graph_id: &str, owner: &str) -> GraphResult<()> {
        let mut state = self.state.write().await;
        match state.leases.get(project_graph_id) {
            Some(holder) if holder != owner => Err(GraphError::LeaseHeld {
                project: project_graph_id.to_string(),
                holder: holder.clone(),
            }),
            _ => {
                state
                    .leases
                    .insert(project_graph_id.to_string(), owner.to_string());
                Ok(())
            }
        }
    }

    async fn release_lease(&self, project_graph_id: &str, owner: &str) -> GraphResult<()> {
        let mut state = self.state.write().await;
        if state.leases.get(project_graph_id).map(String::as_str) == Some(owner) {
            state.leases.remove(project_graph_id);
        }
        Ok(())
    }
}
