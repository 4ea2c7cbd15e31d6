//! Analysis worker
//!
//! Consumes analysis jobs from the queue and drives the pipeline:
//! fetch → graph build/update → context synthesis → LLM → persisted
//! findings. The request record advances through its state machine before
//! each step's external I/O begins, so a restarted worker can see how far a
//! job got. Workers are idempotent per job id: a redelivered envelope whose
//! record is already terminal is acknowledged and dropped.
//!
//! Every job failure is terminal here. The job is acknowledged either way;
//! operators re-enqueue manually, which keeps duplicate findings out.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::context::{BuiltContext, ContextBuilder};
use crate::fetch::{Fetched, SourceFetcher};
use crate::graph::{
    CkgBuilder, GraphBackend, IncrementalUpdater, ProjectDescriptor, QueryApi,
};
use crate::llm::{
    CompletionBackend, HttpCompletionBackend, LlmAnalysisResult, LlmClient, LlmError,
};
use crate::models::{
    AnalysisJob, AnalysisRequest, Finding, JobKind, LlmProviderConfig, RequestStatus, Severity,
};
use crate::persistence::{FindingStore, RequestStore};
use crate::prompts;
use crate::queue::{Delivery, JobQueue};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Fetch(#[from] crate::fetch::FetchError),

    #[error(transparent)]
    Build(#[from] crate::graph::BuildError),

    #[error(transparent)]
    Update(#[from] crate::graph::UpdateError),

    #[error(transparent)]
    Graph(#[from] crate::graph::GraphError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("persistence error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    #[error("canceled")]
    Canceled,

    #[error("timeout after {0}s")]
    Timeout(u64),
}

/// Resolves a completion backend for a job's provider config.
pub trait BackendFactory: Send + Sync {
    fn backend_for(
        &self,
        config: &LlmProviderConfig,
    ) -> Result<Arc<dyn CompletionBackend>, LlmError>;
}

/// Production factory over the HTTP providers.
pub struct HttpBackendFactory {
    settings: Arc<Settings>,
}

impl HttpBackendFactory {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn backend_for(
        &self,
        config: &LlmProviderConfig,
    ) -> Result<Arc<dyn CompletionBackend>, LlmError> {
        Ok(Arc::new(HttpCompletionBackend::from_config(
            config,
            &self.settings.llm,
        )?))
    }
}

/// Everything a worker needs besides its settings.
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub graph: Arc<dyn GraphBackend>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub requests: Arc<dyn RequestStore>,
    pub findings: Arc<dyn FindingStore>,
    pub builder: Arc<CkgBuilder>,
    pub updater: Arc<IncrementalUpdater>,
    pub backends: Arc<dyn BackendFactory>,
}

pub struct AnalysisWorker {
    settings: Arc<Settings>,
    deps: WorkerDeps,
    query: QueryApi,
    context: ContextBuilder,
    llm: LlmClient,
    worker_id: String,
}

impl AnalysisWorker {
    pub fn new(settings: Arc<Settings>, deps: WorkerDeps, llm: LlmClient) -> Self {
        let query = QueryApi::new(Arc::clone(&deps.graph));
        Self {
            settings,
            query,
            context: ContextBuilder::default(),
            llm,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            deps,
        }
    }

    /// Run `max_workers` consumer loops until `shutdown` trips. Jobs in
    /// flight across all loops stay bounded by `max_concurrent_analyses`.
    pub async fn run_pool(self: Arc<Self>, shutdown: CancelToken) {
        let limiter = Arc::new(Semaphore::new(self.settings.max_concurrent_analyses.max(1)));
        let mut handles = Vec::new();
        for _ in 0..self.settings.max_workers.max(1) {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                worker.consume_loop(shutdown, limiter).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn consume_loop(&self, shutdown: CancelToken, limiter: Arc<Semaphore>) {
        while !shutdown.is_canceled() {
            let delivery = match self.deps.queue.dequeue().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                Err(error) => {
                    error!(error = %error, "queue dequeue failed, stopping consumer");
                    return;
                }
            };
            let Ok(_permit) = limiter.acquire().await else {
                return;
            };
            self.handle_delivery(delivery, &shutdown).await;
        }
    }

    async fn handle_delivery(&self, delivery: Delivery, shutdown: &CancelToken) {
        let job_id = delivery.job.job_id;
        if delivery.delivery_count > 1 {
            info!(%job_id, count = delivery.delivery_count, "redelivered job");
        }
        self.process_job(&delivery.job, shutdown).await;
        if let Err(error) = self.deps.queue.ack(delivery.receipt).await {
            warn!(%job_id, error = %error, "failed to ack delivery");
        }
    }

    /// Drive one job to a terminal state. Never returns an error: failures
    /// become the `failed` status with an `error_message`.
    pub async fn process_job(&self, job: &AnalysisJob, cancel: &CancelToken) -> AnalysisRequest {
        let mut request = match self.deps.requests.load(job.job_id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => AnalysisRequest::from_job(job),
            Err(error) => {
                error!(job_id = %job.job_id, error = %error, "request store unavailable");
                let mut request = AnalysisRequest::from_job(job);
                request.status = RequestStatus::Failed;
                request.error_message = Some(error.to_string());
                return request;
            }
        };

        // Duplicate suppression: at-least-once delivery meets a terminal
        // record here.
        if request.status.is_terminal() {
            info!(
                job_id = %job.job_id,
                status = ?request.status,
                "job already terminal, dropping duplicate delivery"
            );
            return request;
        }

        request.status = RequestStatus::Processing;
        request.started_at = Some(Utc::now());
        if let Err(error) = self.deps.requests.save(&request).await {
            error!(job_id = %job.job_id, error = %error, "cannot persist request");
            request.status = RequestStatus::Failed;
            request.error_message = Some(error.to_string());
            return request;
        }

        let started = std::time::Instant::now();
        let deadline = Duration::from_secs(self.settings.analysis_timeout_secs.max(1));
        let outcome = tokio::time::timeout(deadline, self.execute(job, &mut request, cancel)).await;

        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(self.settings.analysis_timeout_secs)),
        };

        match outcome {
            Ok(severity_counts) => {
                request.status = RequestStatus::Completed;
                request.completed_at = Some(Utc::now());
                request.error_message = None;
                info!(
                    job_id = %job.job_id,
                    project = %job.project_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ?severity_counts,
                    "analysis completed"
                );
            }
            Err(error) => {
                let message = if cancel.is_canceled() {
                    "canceled".to_string()
                } else {
                    error.to_string()
                };
                warn!(
                    job_id = %job.job_id,
                    project = %job.project_id,
                    error = %message,
                    "analysis failed"
                );
                request.status = RequestStatus::Failed;
                request.completed_at = Some(Utc::now());
                request.error_message = Some(message);
            }
        }
        if let Err(error) = self.deps.requests.save(&request).await {
            error!(job_id = %job.job_id, error = %error, "cannot persist terminal request state");
        }
        let _ = self
            .deps
            .graph
            .release_lease(&request.project_graph_id, &self.worker_id)
            .await;
        request
    }

    /// The pipeline proper; returns per-severity finding counts.
    async fn execute(
        &self,
        job: &AnalysisJob,
        request: &mut AnalysisRequest,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<&'static str, usize>, WorkerError> {
        let project = ProjectDescriptor::new(
            job.project_id.clone(),
            project_name_from_url(&job.repo_ref.url),
            "auto".to_string(),
        );
        self.deps
            .graph
            .try_acquire_lease(&project.graph_id, &self.worker_id)
            .await?;

        self.check(cancel)?;
        let fetched = self
            .deps
            .fetcher
            .fetch(&job.repo_ref, job.kind, cancel)
            .await?;
        self.advance(request, RequestStatus::SourceFetched).await?;

        self.check(cancel)?;
        self.advance(request, RequestStatus::CkgBuilding).await?;
        self.build_graph(&project, &fetched, cancel).await?;
        self.advance(request, RequestStatus::Analyzing).await?;

        self.check(cancel)?;
        let mut project = project;
        if let Some(language) = self.dominant_language(&project.graph_id).await? {
            project.language = language.clone();
            self.deps
                .graph
                .upsert_node(
                    crate::graph::NodeRecord::new(
                        crate::graph::NodeKind::Project,
                        crate::graph::CompositeId::project(&project.graph_id),
                    )
                    .with("language", language),
                )
                .await?;
        }

        let overview = self.query.project_overview(&project.graph_id).await?;
        let built = match (&job.kind, &job.repo_ref.pr, &fetched.pr) {
            (JobKind::PrScan, Some(pr), Some(delta)) => self.context.build_pr_scan(
                &project,
                job,
                &overview,
                fetched.workspace.root(),
                pr,
                delta,
            ),
            _ => self
                .context
                .build_full_scan(&project, job, &overview, fetched.workspace.root()),
        };

        let findings = match built {
            BuiltContext::Empty { project_summary } => {
                vec![Finding::raw_fallback(job.job_id, project_summary)]
            }
            BuiltContext::Ready(variables) => {
                self.check(cancel)?;
                let backend = self.deps.backends.backend_for(&job.llm_config)?;
                let template = match job.analysis_template.as_deref() {
                    Some(name) => name,
                    None => match job.kind {
                        JobKind::PrScan => prompts::PR_DEEP_LOGIC,
                        JobKind::FullScan => prompts::FULL_PROJECT_ARCHITECTURE,
                    },
                };
                let temperature = job
                    .llm_config
                    .temperature
                    .unwrap_or(self.settings.llm.temperature);
                let result = self
                    .llm
                    .invoke(template, &variables, backend.as_ref(), temperature)
                    .await?;
                self.findings_from_result(job, &fetched, result)
            }
        };

        let mut severity_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for finding in &findings {
            *severity_counts.entry(finding.severity.as_str()).or_default() += 1;
        }
        self.deps.findings.insert_all(&findings).await?;
        Ok(severity_counts)
    }

    fn check(&self, cancel: &CancelToken) -> Result<(), WorkerError> {
        cancel.ensure_active().map_err(|_| WorkerError::Canceled)
    }

    /// Most common language across the project's file nodes.
    async fn dominant_language(
        &self,
        project_graph_id: &str,
    ) -> Result<Option<String>, WorkerError> {
        let files = self
            .deps
            .graph
            .nodes_by_kind(crate::graph::NodeKind::File, project_graph_id)
            .await?;
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for file in &files {
            if let Some(language) = file.str_prop("language") {
                *counts.entry(language).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(language, _)| language.to_string()))
    }

    async fn advance(
        &self,
        request: &mut AnalysisRequest,
        status: RequestStatus,
    ) -> Result<(), WorkerError> {
        request.status = status;
        self.deps.requests.save(request).await?;
        Ok(())
    }

    /// Full build for a fresh project, incremental update otherwise. The
    /// whole build is retried once before the job fails.
    async fn build_graph(
        &self,
        project: &ProjectDescriptor,
        fetched: &Fetched,
        cancel: &CancelToken,
    ) -> Result<(), WorkerError> {
        let root = fetched.workspace.root();
        let fresh = self.deps.graph.file_hashes(&project.graph_id).await?.is_empty();
        let attempt = || async {
            if fresh {
                self.deps
                    .builder
                    .build_project(project, root, cancel)
                    .await
                    .map(|_| ())
                    .map_err(WorkerError::from)
            } else {
                self.deps
                    .updater
                    .update_from_tree(project, root, cancel)
                    .await
                    .map(|_| ())
                    .map_err(WorkerError::from)
            }
        };
        match attempt().await {
            Ok(()) => Ok(()),
            Err(WorkerError::Canceled) => Err(WorkerError::Canceled),
            Err(first) => {
                warn!(error = %first, "graph build failed, retrying job-level once");
                self.check(cancel)?;
                attempt().await
            }
        }
    }

    /// Structured findings become rows; an unparseable reply becomes exactly
    /// one raw-content fallback row. Nothing the model said is dropped.
    fn findings_from_result(
        &self,
        job: &AnalysisJob,
        fetched: &Fetched,
        result: LlmAnalysisResult,
    ) -> Vec<Finding> {
        if !result.parsing_succeeded {
            let raw = if result.raw_content.is_empty() {
                format!(
                    "The analysis model was unreachable ({}).",
                    result
                        .parsing_error
                        .as_deref()
                        .unwrap_or("unknown error")
                )
            } else {
                result.raw_content.clone()
            };
            return vec![Finding::raw_fallback(job.job_id, raw)];
        }

        let output = result.parsed_output.unwrap_or_default();
        let mut rows = Vec::new();
        for finding in output.findings {
            let code_snippet = fetched.pr.as_ref().and_then(|delta| {
                delta
                    .changed_files
                    .iter()
                    .find(|f| f.path == finding.file_path)
                    .and_then(|f| f.content.as_deref())
                    .and_then(|content| {
                        extract_snippet(content, finding.line_start, finding.line_end)
                    })
            });
            rows.push(Finding {
                request_id: job.job_id,
                file_path: finding.file_path,
                line_start: finding.line_start,
                line_end: finding.line_end,
                severity: finding.severity,
                category: finding.category,
                message: finding.message,
                suggestion: finding.suggestion,
                finding_type: finding.finding_type,
                code_snippet,
                raw_llm_content: None,
            });
        }
        if let Some(summary) = output.project_summary {
            rows.push(Finding {
                request_id: job.job_id,
                file_path: "Project Summary".to_string(),
                line_start: None,
                line_end: None,
                severity: Severity::Info,
                category: "Summary".to_string(),
                message: summary,
                suggestion: None,
                finding_type: "project_summary".to_string(),
                code_snippet: None,
                raw_llm_content: None,
            });
        }
        if rows.is_empty() {
            // Completed requests always carry at least one record.
            rows.push(Finding::raw_fallback(job.job_id, result.raw_content));
        }
        rows
    }
}

fn project_name_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}

/// 1-based inclusive line range from file content.
fn extract_snippet(content: &str, start: Option<u32>, end: Option<u32>) -> Option<String> {
    let start = start? as usize;
    let end = end.map(|e| e as usize).unwrap_or(start);
    if start == 0 || end < start {
        return None;
    }
    let lines: Vec<&str> = content.lines().collect();
    if start > lines.len() {
        return None;
    }
    let end = end.min(lines.len());
    Some(lines[start - 1..end].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_extraction_handles_ranges() {
        let content = "one\ntwo\nthree\nfour";
        assert_eq!(
            extract_snippet(content, Some(2), Some(3)).as_deref(),
            Some("two\nthree")
        );
        assert_eq!(extract_snippet(content, Some(4), None).as_deref(), Some("four"));
        assert_eq!(extract_snippet(content, Some(9), None), None);
        assert_eq!(extract_snippet(content, None, Some(2)), None);
        // end clamped to the file
        assert_eq!(
            extract_snippet(content, Some(3), Some(99)).as_deref(),
            Some("three\nfour")
        );
    }

    #[test]
    fn project_names_come_from_the_repo_url() {
        assert_eq!(
            project_name_from_url("https://example.com/org/thing.git"),
            "thing"
        );
        assert_eq!(project_name_from_url("https://example.com/org/thing/"), "thing");
    }
}
