//! End-to-end pipeline scenarios over the in-memory backends.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use vigil::cancel::CancelToken;
use vigil::config::Settings;
use vigil::fetch::PathFetcher;
use vigil::graph::{
    CkgBuilder, CompositeId, GraphBackend, IncrementalUpdater, MemoryGraph, NodeKind,
    ProjectDescriptor, QueryApi,
};
use vigil::language::ParserRegistry;
use vigil::llm::{CompletionBackend, CompletionRequest, LlmClient, LlmError};
use vigil::models::{
    AnalysisJob, Finding, JobKind, LlmProviderConfig, RepoRef, RequestStatus, Severity,
    RAW_FALLBACK_PATH,
};
use vigil::persistence::{
    FindingStore, MemoryFindingStore, MemoryRequestStore, RequestStore,
};
use vigil::prompts::PromptEngine;
use vigil::queue::MemoryJobQueue;
use vigil::worker::{AnalysisWorker, BackendFactory, WorkerDeps};

/// Backend returning canned replies in order; repeats the last one.
struct ScriptedBackend {
    replies: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            Ok(replies.remove(0))
        } else {
            replies.first().cloned().ok_or(LlmError::Unreachable {
                detail: "no scripted reply".to_string(),
            })
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "test-model"
    }
}

struct ScriptedFactory {
    backend: Arc<ScriptedBackend>,
}

impl BackendFactory for ScriptedFactory {
    fn backend_for(
        &self,
        _config: &LlmProviderConfig,
    ) -> Result<Arc<dyn CompletionBackend>, LlmError> {
        Ok(Arc::clone(&self.backend) as Arc<dyn CompletionBackend>)
    }
}

struct Harness {
    worker: AnalysisWorker,
    graph: Arc<dyn GraphBackend>,
    requests: Arc<MemoryRequestStore>,
    findings: Arc<MemoryFindingStore>,
    project_graph_id: String,
}

fn harness(source_dir: &TempDir, replies: &[&str]) -> Harness {
    let settings = Arc::new(Settings::default());
    let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
    let registry = Arc::new(ParserRegistry::with_builtin_languages(settings.max_file_size).unwrap());
    let builder = Arc::new(CkgBuilder::new(
        Arc::clone(&graph),
        registry,
        settings.batch_size,
        settings.batch_entity_limit,
        4,
    ));
    let updater = Arc::new(IncrementalUpdater::new(
        Arc::clone(&graph),
        Arc::clone(&builder),
        settings.max_placeholder_fraction,
    ));
    let requests = Arc::new(MemoryRequestStore::new());
    let findings = Arc::new(MemoryFindingStore::new());
    let deps = WorkerDeps {
        queue: Arc::new(MemoryJobQueue::new(Duration::from_secs(60))),
        graph: Arc::clone(&graph),
        fetcher: Arc::new(PathFetcher::new(source_dir.path())),
        requests: Arc::clone(&requests) as Arc<dyn RequestStore>,
        findings: Arc::clone(&findings) as Arc<dyn FindingStore>,
        builder,
        updater,
        backends: Arc::new(ScriptedFactory {
            backend: ScriptedBackend::new(replies),
        }),
    };
    let llm = LlmClient::new(Arc::new(PromptEngine::new(None)), 3)
        .with_base_backoff(Duration::from_millis(1));
    Harness {
        worker: AnalysisWorker::new(settings, deps, llm),
        graph,
        requests,
        findings,
        project_graph_id: vigil::models::project_graph_id("p1"),
    }
}

fn job() -> AnalysisJob {
    AnalysisJob::new(
        JobKind::FullScan,
        "p1",
        RepoRef {
            url: "https://example.com/demo.git".into(),
            branch: "main".into(),
            commit: None,
            pr: None,
        },
    )
}

fn three_file_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, class) in [("one.py", "Alpha"), ("two.py", "Beta"), ("three.py", "Gamma")] {
        std::fs::write(
            dir.path().join(name),
            format!(
                "class {class}:\n    def load(self):\n        return 1\n\n    def save(self):\n        return self.load()\n"
            ),
        )
        .unwrap();
    }
    dir
}

const EMPTY_FINDINGS: &str = r#"{"findings":[]}"#;

/// Scenario: full scan over three Python files, happy path.
#[tokio::test]
async fn full_scan_happy_path() {
    let dir = three_file_repo();
    let reply = r#"{"findings":[{"file_path":"one.py","line_start":2,"line_end":3,"severity":"Warning","finding_category":"Logic","message":"load returns a constant","suggestion":"compute it"}]}"#;
    let h = harness(&dir, &[reply]);

    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(request.started_at.unwrap() <= request.completed_at.unwrap());

    let overview = QueryApi::new(Arc::clone(&h.graph))
        .project_overview(&h.project_graph_id)
        .await
        .unwrap();
    assert_eq!(overview.total_files, 3);
    assert_eq!(overview.total_classes, 3);
    assert_eq!(overview.total_functions_methods, 6);

    let rows = h.findings.for_request(request.job_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].severity, Severity::Warning);
    assert!(rows[0].raw_llm_content.is_none());
}

/// Scenario: incremental update after one file changed.
#[tokio::test]
async fn incremental_update_one_file_changed() {
    let dir = three_file_repo();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    h.worker.process_job(&job(), &CancelToken::new()).await;

    let two = h
        .graph
        .get_node(&CompositeId::file(&h.project_graph_id, "two.py"))
        .await
        .unwrap()
        .unwrap();
    let hash_before = two.str_prop("content_hash").unwrap().to_string();

    std::fs::write(
        dir.path().join("two.py"),
        "class Beta:\n    def reload(self):\n        return 2\n",
    )
    .unwrap();

    // Second job on the same project takes the incremental path.
    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);

    let two_after = h
        .graph
        .get_node(&CompositeId::file(&h.project_graph_id, "two.py"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(two_after.str_prop("content_hash").unwrap(), hash_before);

    let functions = h
        .graph
        .nodes_by_kind(NodeKind::Function, &h.project_graph_id)
        .await
        .unwrap();
    let names: Vec<&str> = functions.iter().filter_map(|f| f.str_prop("name")).collect();
    assert!(names.contains(&"reload"));
    // two.py's old symbols are gone; the untouched files keep theirs.
    let in_two: Vec<&str> = functions
        .iter()
        .filter(|f| f.str_prop("file_path") == Some("two.py"))
        .filter_map(|f| f.str_prop("name"))
        .collect();
    assert_eq!(in_two, vec!["reload"]);
    assert!(functions
        .iter()
        .any(|f| f.str_prop("file_path") == Some("one.py")));
}

/// Scenario: incremental update after a file was deleted.
#[tokio::test]
async fn incremental_update_file_deleted() {
    let dir = three_file_repo();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    h.worker.process_job(&job(), &CancelToken::new()).await;

    std::fs::remove_file(dir.path().join("three.py")).unwrap();
    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);

    assert!(h
        .graph
        .get_node(&CompositeId::file(&h.project_graph_id, "three.py"))
        .await
        .unwrap()
        .is_none());
    let classes = h
        .graph
        .nodes_by_kind(NodeKind::Class, &h.project_graph_id)
        .await
        .unwrap();
    assert!(classes.iter().all(|c| c.str_prop("name") != Some("Gamma")));
}

/// Scenario: the model wraps valid JSON in prose; the reply is salvaged and
/// no raw-content row is persisted.
#[tokio::test]
async fn malformed_reply_with_recoverable_json() {
    let dir = three_file_repo();
    let h = harness(
        &dir,
        &[r#"Here's the analysis: {"findings":[{"file_path":"one.py","severity":"Note","message":"fine"}]} hope it helps"#],
    );
    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);
    let rows = h.findings.for_request(request.job_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].raw_llm_content.is_none());
    assert_eq!(rows[0].severity, Severity::Note);
}

/// Scenario: prose-only reply; repair also fails; the full text survives as
/// exactly one fallback row and the request still completes.
#[tokio::test]
async fn prose_only_reply_becomes_raw_fallback() {
    let dir = three_file_repo();
    let prose = "The code looks mostly fine, though load() is suspicious.";
    let h = harness(&dir, &[prose, "still just prose"]);
    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);

    let rows = h.findings.for_request(request.job_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.file_path, RAW_FALLBACK_PATH);
    assert_eq!(row.severity, Severity::Info);
    assert_eq!(row.raw_llm_content.as_deref(), Some(prose));
}

/// Scenario: cancellation marks the request failed with the explicit reason.
#[tokio::test]
async fn cancellation_fails_the_job() {
    let dir = three_file_repo();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let request = h.worker.process_job(&job(), &cancel).await;
    assert_eq!(request.status, RequestStatus::Failed);
    assert_eq!(request.error_message.as_deref(), Some("canceled"));
    assert!(h
        .findings
        .for_request(request.job_id)
        .await
        .unwrap()
        .is_empty());
}

/// Boundary: empty repository completes with one explanatory fallback row.
#[tokio::test]
async fn empty_repository_completes_with_explanation() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);

    let rows = h.findings.for_request(request.job_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].file_path, RAW_FALLBACK_PATH);
    assert!(rows[0]
        .raw_llm_content
        .as_deref()
        .unwrap()
        .contains("no analyzable source"));
}

/// P4: raw content appears exactly on fallback rows.
#[tokio::test]
async fn raw_content_only_on_fallback_rows() {
    let dir = three_file_repo();
    let h = harness(&dir, &["not json at all", "not json either"]);
    let request = h.worker.process_job(&job(), &CancelToken::new()).await;
    for row in h.findings.for_request(request.job_id).await.unwrap() {
        let is_fallback =
            row.file_path == RAW_FALLBACK_PATH && row.severity == Severity::Info;
        assert_eq!(
            row.raw_llm_content.as_ref().map(|c| !c.is_empty()),
            if is_fallback { Some(true) } else { None }
        );
    }
}

/// A specialty template selected on the job drives the same pipeline.
#[tokio::test]
async fn specialty_template_override_is_honored() {
    let dir = three_file_repo();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    let security_job = job().with_template(vigil::prompts::SECURITY);
    let request = h.worker.process_job(&security_job, &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Completed);

    // An unknown template is a configuration failure, not a hang.
    let bad = job().with_template("does_not_exist");
    let request = h.worker.process_job(&bad, &CancelToken::new()).await;
    assert_eq!(request.status, RequestStatus::Failed);
    assert!(request.error_message.unwrap().contains("does_not_exist"));
}

/// Duplicate delivery of a terminal job is dropped without a second run.
#[tokio::test]
async fn duplicate_delivery_is_suppressed() {
    let dir = three_file_repo();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    let job = job();
    let first = h.worker.process_job(&job, &CancelToken::new()).await;
    assert_eq!(first.status, RequestStatus::Completed);
    let rows_before = h.findings.for_request(job.job_id).await.unwrap().len();

    let second = h.worker.process_job(&job, &CancelToken::new()).await;
    assert_eq!(second.status, RequestStatus::Completed);
    assert_eq!(
        h.findings.for_request(job.job_id).await.unwrap().len(),
        rows_before
    );
    // The stored record was not rewritten by the duplicate.
    let stored = h.requests.load(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.completed_at, first.completed_at);
}

/// Law: parsing a file, deleting its descendants, and re-parsing identical
/// bytes yields the same subgraph.
#[tokio::test]
async fn build_delete_build_round_trip() {
    let dir = three_file_repo();
    let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
    let registry = Arc::new(ParserRegistry::with_builtin_languages(1_048_576).unwrap());
    let builder = CkgBuilder::new(Arc::clone(&graph), registry, 50, 10_000, 4);
    let project = ProjectDescriptor::new("p1", "demo", "python");

    builder
        .build_project(&project, dir.path(), &CancelToken::new())
        .await
        .unwrap();
    let before = graph.counts(&project.graph_id).await.unwrap();
    let mut ids_before: Vec<String> = graph
        .nodes_by_kind(NodeKind::Function, &project.graph_id)
        .await
        .unwrap()
        .iter()
        .map(|f| f.id.to_string())
        .collect();
    ids_before.sort();

    graph
        .delete_file_and_descendants(&CompositeId::file(&project.graph_id, "one.py"))
        .await
        .unwrap();
    builder
        .rebuild_files(
            &project,
            dir.path(),
            &[dir.path().join("one.py")],
            &CancelToken::new(),
        )
        .await
        .unwrap();

    let after = graph.counts(&project.graph_id).await.unwrap();
    assert_eq!(before, after);
    let mut ids_after: Vec<String> = graph
        .nodes_by_kind(NodeKind::Function, &project.graph_id)
        .await
        .unwrap()
        .iter()
        .map(|f| f.id.to_string())
        .collect();
    ids_after.sort();
    assert_eq!(ids_before, ids_after);
}

/// Boundary: a single file over the size ceiling yields a File node with the
/// oversize note and no symbols, and the job completes.
#[tokio::test]
async fn oversize_file_is_annotated_not_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("big.py"),
        "def f():\n    pass\n".repeat(64),
    )
    .unwrap();

    let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
    // Ceiling far below the file size.
    let registry = Arc::new(ParserRegistry::with_builtin_languages(64).unwrap());
    let builder = CkgBuilder::new(Arc::clone(&graph), registry, 50, 10_000, 4);
    let project = ProjectDescriptor::new("p1", "demo", "python");
    builder
        .build_project(&project, dir.path(), &CancelToken::new())
        .await
        .unwrap();

    let file = graph
        .get_node(&CompositeId::file(&project.graph_id, "big.py"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        file.properties["errors"],
        serde_json::json!(["oversize"])
    );
    assert!(graph
        .nodes_by_kind(NodeKind::Function, &project.graph_id)
        .await
        .unwrap()
        .is_empty());
}

/// Every non-Project node carries exactly one BELONGS_TO edge (P1), and
/// classes and functions carry exactly one DEFINED_IN (P2).
#[tokio::test]
async fn ownership_invariants_hold_after_build() {
    let dir = three_file_repo();
    let h = harness(&dir, &[EMPTY_FINDINGS]);
    h.worker.process_job(&job(), &CancelToken::new()).await;

    for kind in [
        NodeKind::File,
        NodeKind::Class,
        NodeKind::Function,
        NodeKind::Variable,
    ] {
        for node in h
            .graph
            .nodes_by_kind(kind, &h.project_graph_id)
            .await
            .unwrap()
        {
            let belongs = h
                .graph
                .edges_from(&node.id, Some(vigil::graph::EdgeKind::BelongsTo))
                .await
                .unwrap();
            assert_eq!(belongs.len(), 1, "{} lacks BELONGS_TO", node.id);
            if matches!(kind, NodeKind::Class | NodeKind::Function)
                && !node.bool_prop("placeholder")
            {
                let defined = h
                    .graph
                    .edges_from(&node.id, Some(vigil::graph::EdgeKind::DefinedIn))
                    .await
                    .unwrap();
                assert_eq!(defined.len(), 1, "{} lacks DEFINED_IN", node.id);
                let file = h.graph.get_node(&defined[0].dst).await.unwrap().unwrap();
                assert_eq!(
                    file.str_prop("path"),
                    node.str_prop("file_path"),
                    "file_path mismatch for {}",
                    node.id
                );
            }
        }
    }
}

/// The queue keeps raw fallback rows and structured rows distinguishable for
/// the report UI (Finding contract).
#[tokio::test]
async fn finding_rows_serialize_for_the_report_ui() {
    let row = Finding::raw_fallback(uuid::Uuid::new_v4(), "raw text");
    let wire = serde_json::to_value(&row).unwrap();
    assert_eq!(wire["file_path"], "Raw LLM Analysis");
    assert_eq!(wire["severity"], "Info");
    assert_eq!(wire["raw_llm_content"], "raw text");
}
