//! HTTP graph backend
//!
//! Speaks the property-graph server's transactional HTTP endpoint
//! (`POST {uri}/db/{database}/tx/commit`), generating parameterized
//! statements internally so no query language reaches callers. A
//! [`WriteBatch`] maps onto a single transactional commit, which is what
//! makes it atomic.
//!
//! Connection settings come from the `NEO4J_*` environment contract via
//! [`GraphStoreConfig`].

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::GraphStoreConfig;

use super::store::{GraphBackend, GraphCounts, GraphError, GraphResult};
use super::types::{
    BatchOp, CompositeId, EdgeKind, EdgeRecord, NodeKind, NodeRecord, WriteBatch,
};

/// One parameterized statement for the transactional endpoint.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub text: String,
    pub parameters: Value,
}

impl Statement {
    fn new(text: impl Into<String>, parameters: Value) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }

    fn to_json(&self) -> Value {
        json!({ "statement": self.text, "parameters": self.parameters })
    }
}

pub(crate) fn upsert_node_statement(node: &NodeRecord) -> Statement {
    Statement::new(
        format!(
            "MERGE (n:{label} {{composite_id: $id}}) SET n += $props",
            label = node.kind.as_str()
        ),
        json!({ "id": node.id.as_str(), "props": Value::Object(node.properties.clone()) }),
    )
}

pub(crate) fn upsert_edge_statement(edge: &EdgeRecord) -> Statement {
    Statement::new(
        format!(
            "MATCH (a {{composite_id: $src}}) MATCH (b {{composite_id: $dst}}) \
             MERGE (a)-[r:{kind}]->(b) SET r += $props",
            kind = edge.kind.as_str()
        ),
        json!({
            "src": edge.src.as_str(),
            "dst": edge.dst.as_str(),
            "props": Value::Object(edge.properties.clone()),
        }),
    )
}

pub(crate) fn delete_file_statement(file_id: &CompositeId) -> Statement {
    Statement::new(
        "MATCH (n) WHERE n.composite_id = $id OR n.composite_id STARTS WITH $prefix \
         DETACH DELETE n",
        json!({ "id": file_id.as_str(), "prefix": format!("{}:", file_id.as_str()) }),
    )
}

fn batch_statements(batch: &WriteBatch) -> Vec<Statement> {
    batch
        .ops
        .iter()
        .map(|op| match op {
            BatchOp::UpsertNode(node) => upsert_node_statement(node),
            BatchOp::UpsertEdge(edge) => upsert_edge_statement(edge),
            BatchOp::DeleteFileDescendants(file_id) => delete_file_statement(file_id),
        })
        .collect()
}

pub struct CypherHttpGraph {
    client: reqwest::Client,
    commit_url: String,
    username: String,
    password: String,
}

impl CypherHttpGraph {
    pub fn new(config: &GraphStoreConfig) -> Self {
        let base = config.uri.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            commit_url: format!("{base}/db/{}/tx/commit", config.database),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    /// Uniqueness constraints and lookup indexes the read paths rely on.
    pub async fn ensure_indexes(&self) -> GraphResult<()> {
        let mut statements = Vec::new();
        for kind in NodeKind::ALL {
            statements.push(Statement::new(
                format!(
                    "CREATE CONSTRAINT IF NOT EXISTS FOR (n:{label}) \
                     REQUIRE n.composite_id IS UNIQUE",
                    label = kind.as_str()
                ),
                json!({}),
            ));
        }
        for (label, property) in [
            ("File", "content_hash"),
            ("File", "updated_at"),
            ("Function", "name"),
            ("Class", "name"),
        ] {
            statements.push(Statement::new(
                format!("CREATE INDEX IF NOT EXISTS FOR (n:{label}) ON (n.{property})"),
                json!({}),
            ));
        }
        // Constraint DDL cannot share a transaction; issue them one by one.
        for statement in statements {
            self.commit(vec![statement]).await?;
        }
        Ok(())
    }

    /// POST statements to the transactional endpoint; server-side errors
    /// surface as [`GraphError::Backend`].
    async fn commit(&self, statements: Vec<Statement>) -> GraphResult<Vec<Value>> {
        let body = json!({
            "statements": statements.iter().map(Statement::to_json).collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(GraphError::Transport(format!("http status {status}")));
        }
        if let Some(errors) = payload.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                return Err(GraphError::Backend(errors[0].to_string()));
            }
        }
        Ok(payload
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Rows of the first result as arrays of column values.
    async fn query_rows(&self, statement: Statement) -> GraphResult<Vec<Vec<Value>>> {
        let results = self.commit(vec![statement]).await?;
        let Some(first) = results.first() else {
            return Ok(Vec::new());
        };
        let rows = first
            .get("data")
            .and_then(|d| d.as_array())
            .map(|data| {
                data.iter()
                    .filter_map(|entry| entry.get("row").and_then(|r| r.as_array()).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    fn node_from_row(kind: NodeKind, row: &[Value]) -> Option<NodeRecord> {
        let id = row.first()?.as_str()?;
        let properties = row.get(1)?.as_object()?.clone();
        Some(NodeRecord {
            kind,
            id: CompositeId::raw(id),
            properties,
        })
    }

    fn edge_from_row(row: &[Value]) -> Option<EdgeRecord> {
        let kind = EdgeKind::from_type(row.first()?.as_str()?)?;
        let src = row.get(1)?.as_str()?;
        let dst = row.get(2)?.as_str()?;
        let properties = row
            .get(3)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_else(Map::new);
        Some(EdgeRecord {
            kind,
            src: CompositeId::raw(src),
            dst: CompositeId::raw(dst),
            properties,
        })
    }
}

#[async_trait]
impl GraphBackend for CypherHttpGraph {
    async fn upsert_node(&self, node: NodeRecord) -> GraphResult<()> {
        self.commit(vec![upsert_node_statement(&node)]).await?;
        Ok(())
    }

    async fn upsert_edge(&self, edge: EdgeRecord) -> GraphResult<()> {
        self.commit(vec![upsert_edge_statement(&edge)]).await?;
        Ok(())
    }

    async fn apply(&self, batch: WriteBatch) -> GraphResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.commit(batch_statements(&batch)).await?;
        Ok(())
    }

    async fn delete_file_and_descendants(&self, file_id: &CompositeId) -> GraphResult<()> {
        self.commit(vec![delete_file_statement(file_id)]).await?;
        Ok(())
    }

    async fn delete_node(&self, id: &CompositeId) -> GraphResult<()> {
        self.commit(vec![Statement::new(
            "MATCH (n {composite_id: $id}) DETACH DELETE n",
            json!({ "id": id.as_str() }),
        )])
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: &CompositeId) -> GraphResult<Option<NodeRecord>> {
        let rows = self
            .query_rows(Statement::new(
                "MATCH (n {composite_id: $id}) \
                 RETURN n.composite_id, properties(n), labels(n) LIMIT 1",
                json!({ "id": id.as_str() }),
            ))
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let kind = row
            .get(2)
            .and_then(|labels| labels.as_array())
            .and_then(|labels| labels.first())
            .and_then(|label| label.as_str())
            .and_then(NodeKind::from_label)
            .ok_or_else(|| GraphError::Backend("node without a known label".to_string()))?;
        Ok(Self::node_from_row(kind, row))
    }

    async fn nodes_by_kind(
        &self,
        kind: NodeKind,
        project_graph_id: &str,
    ) -> GraphResult<Vec<NodeRecord>> {
        let rows = self
            .query_rows(Statement::new(
                format!(
                    "MATCH (n:{label}) WHERE n.project_id = $pid OR n.composite_id = $pid \
                     RETURN n.composite_id, properties(n) ORDER BY n.composite_id",
                    label = kind.as_str()
                ),
                json!({ "pid": project_graph_id }),
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| Self::node_from_row(kind, row))
            .collect())
    }

    async fn nodes_by_name(
        &self,
        kind: NodeKind,
        project_graph_id: &str,
        name: &str,
    ) -> GraphResult<Vec<NodeRecord>> {
        let rows = self
            .query_rows(Statement::new(
                format!(
                    "MATCH (n:{label}) WHERE n.project_id = $pid AND n.name = $name \
                     RETURN n.composite_id, properties(n) ORDER BY n.composite_id",
                    label = kind.as_str()
                ),
                json!({ "pid": project_graph_id, "name": name }),
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| Self::node_from_row(kind, row))
            .collect())
    }

    async fn edges_from(
        &self,
        src: &CompositeId,
        kind: Option<EdgeKind>,
    ) -> GraphResult<Vec<EdgeRecord>> {
        let pattern = match kind {
            Some(kind) => format!("-[r:{}]->", kind.as_str()),
            None => "-[r]->".to_string(),
        };
        let rows = self
            .query_rows(Statement::new(
                format!(
                    "MATCH (a {{composite_id: $id}}){pattern}(b) \
                     RETURN type(r), a.composite_id, b.composite_id, properties(r)"
                ),
                json!({ "id": src.as_str() }),
            ))
            .await?;
        Ok(rows.iter().filter_map(|row| Self::edge_from_row(row)).collect())
    }

    async fn edges_to(
        &self,
        dst: &CompositeId,
        kind: Option<EdgeKind>,
    ) -> GraphResult<Vec<EdgeRecord>> {
        let pattern = match kind {
            Some(kind) => format!("-[r:{}]->", kind.as_str()),
            None => "-[r]->".to_string(),
        };
        let rows = self
            .query_rows(Statement::new(
                format!(
                    "MATCH (a){pattern}(b {{composite_id: $id}}) \
                     RETURN type(r), a.composite_id, b.composite_id, properties(r)"
                ),
                json!({ "id": dst.as_str() }),
            ))
            .await?;
        Ok(rows.iter().filter_map(|row| Self::edge_from_row(row)).collect())
    }

    async fn edges_by_kind(
        &self,
        kind: EdgeKind,
        project_graph_id: &str,
    ) -> GraphResult<Vec<EdgeRecord>> {
        let rows = self
            .query_rows(Statement::new(
                format!(
                    "MATCH (a)-[r:{kind}]->(b) WHERE a.project_id = $pid \
                     RETURN type(r), a.composite_id, b.composite_id, properties(r)",
                    kind = kind.as_str()
                ),
                json!({ "pid": project_graph_id }),
            ))
            .await?;
        Ok(rows.iter().filter_map(|row| Self::edge_from_row(row)).collect())
    }

    async fn file_hashes(&self, project_graph_id: &str) -> GraphResult<Vec<(String, String)>> {
        let rows = self
            .query_rows(Statement::new(
                "MATCH (f:File) WHERE f.project_id = $pid AND f.content_hash IS NOT NULL \
                 RETURN f.path, f.content_hash",
                json!({ "pid": project_graph_id }),
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some((
                    row.first()?.as_str()?.to_string(),
                    row.get(1)?.as_str()?.to_string(),
                ))
            })
            .collect())
    }

    async fn counts(&self, project_graph_id: &str) -> GraphResult<GraphCounts> {
        let node_rows = self
            .query_rows(Statement::new(
                "MATCH (n) WHERE n.project_id = $pid OR n.composite_id = $pid \
                 RETURN count(n)",
                json!({ "pid": project_graph_id }),
            ))
            .await?;
        let edge_rows = self
            .query_rows(Statement::new(
                "MATCH (a)-[r]->() WHERE a.project_id = $pid OR a.composite_id = $pid \
                 RETURN count(r)",
                json!({ "pid": project_graph_id }),
            ))
            .await?;
        let scalar = |rows: &[Vec<Value>]| {
            rows.first()
                .and_then(|row| row.first())
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize
        };
        Ok(GraphCounts {
            nodes: scalar(&node_rows),
            edges: scalar(&edge_rows),
        })
    }

    async fn try_acquire_lease(&self, project_graph_id: &str, owner: &str) -> GraphResult<()> {
        let rows = self
            .query_rows(Statement::new(
                "MERGE (l:ProjectLease {project: $project}) \
                 ON CREATE SET l.owner = $owner \
                 RETURN l.owner",
                json!({ "project": project_graph_id, "owner": owner }),
            ))
            .await?;
        let holder = rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_str())
            .unwrap_or(owner)
            .to_string();
        if holder == owner {
            Ok(())
        } else {
            Err(GraphError::LeaseHeld {
                project: project_graph_id.to_string(),
                holder,
            })
        }
    }

    async fn release_lease(&self, project_graph_id: &str, owner: &str) -> GraphResult<()> {
        self.commit(vec![Statement::new(
            "MATCH (l:ProjectLease {project: $project, owner: $owner}) DELETE l",
            json!({ "project": project_graph_id, "owner": owner }),
        )])
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_upserts_merge_on_composite_id() {
        let node = NodeRecord::new(
            NodeKind::Class,
            CompositeId::symbol_at("p", "a.py", "Alpha", 1),
        )
        .with("name", "Alpha");
        let statement = upsert_node_statement(&node);
        assert!(statement.text.starts_with("MERGE (n:Class"));
        assert_eq!(statement.parameters["id"], "p:a.py:Alpha:1");
        assert_eq!(statement.parameters["props"]["name"], "Alpha");
    }

    #[test]
    fn file_delete_cascades_by_id_prefix() {
        let statement = delete_file_statement(&CompositeId::file("p", "a.py"));
        assert!(statement.text.contains("STARTS WITH $prefix"));
        assert_eq!(statement.parameters["prefix"], "p:a.py:");
    }

    #[test]
    fn batch_preserves_operation_order() {
        let mut batch = WriteBatch::new();
        batch.delete_file_descendants(CompositeId::file("p", "a.py"));
        batch.upsert_node(NodeRecord::new(NodeKind::File, CompositeId::file("p", "a.py")));
        let statements = batch_statements(&batch);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].text.contains("DETACH DELETE"));
        assert!(statements[1].text.starts_with("MERGE"));
    }
}
