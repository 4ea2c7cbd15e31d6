//! vigil CLI
//!
//! `worker` drains a file of job envelopes through the full pipeline,
//! `scan` runs a one-shot analysis of a local tree, and `overview` prints
//! the graph summary for a tree without invoking any model.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use vigil::cancel::CancelToken;
use vigil::config::Settings;
use vigil::fetch::{GitFetcher, PathFetcher, SourceFetcher};
use vigil::graph::http_store::CypherHttpGraph;
use vigil::graph::{
    CkgBuilder, GraphBackend, IncrementalUpdater, MemoryGraph, ProjectDescriptor, QueryApi,
};
use vigil::language::ParserRegistry;
use vigil::llm::LlmClient;
use vigil::models::{AnalysisJob, JobKind, RepoRef};
use vigil::persistence::{FindingStore, MemoryFindingStore, MemoryRequestStore};
use vigil::prompts::PromptEngine;
use vigil::queue::{JobQueue, MemoryJobQueue};
use vigil::worker::{AnalysisWorker, HttpBackendFactory, WorkerDeps};

#[derive(Parser)]
#[command(name = "vigil", version, about = "CKG-backed repository analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume job envelopes (JSON lines) through the analysis pipeline.
    Worker {
        /// File with one AnalysisJob JSON envelope per line.
        #[arg(long)]
        jobs: PathBuf,
    },
    /// One-shot full analysis of a local source tree.
    Scan {
        /// Root of the source tree.
        path: PathBuf,
        /// Project identifier used for graph ids.
        #[arg(long, default_value = "local")]
        project_id: String,
        /// Skip the LLM call and stop after the graph build.
        #[arg(long)]
        no_llm: bool,
    },
    /// Build the graph for a local tree and print the project overview.
    Overview {
        path: PathBuf,
        #[arg(long, default_value = "local")]
        project_id: String,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Arc::new(Settings::from_env().context("loading settings")?);

    match cli.command {
        Command::Worker { jobs } => run_worker(settings, jobs).await,
        Command::Scan {
            path,
            project_id,
            no_llm,
        } => run_scan(settings, path, project_id, no_llm).await,
        Command::Overview { path, project_id } => run_overview(settings, path, project_id).await,
    }
}

/// The graph server backend when `NEO4J_URI` is configured, the in-process
/// store otherwise.
async fn graph_backend(settings: &Settings) -> Result<Arc<dyn GraphBackend>> {
    if std::env::var("NEO4J_URI").is_ok() {
        let graph = CypherHttpGraph::new(&settings.graph);
        graph
            .ensure_indexes()
            .await
            .context("creating graph constraints and indexes")?;
        Ok(Arc::new(graph))
    } else {
        Ok(Arc::new(MemoryGraph::new()))
    }
}

async fn pipeline(
    settings: &Arc<Settings>,
    fetcher: Arc<dyn SourceFetcher>,
    queue: Arc<dyn JobQueue>,
) -> Result<(Arc<AnalysisWorker>, Arc<MemoryFindingStore>)> {
    let graph = graph_backend(settings).await?;
    let registry = Arc::new(
        ParserRegistry::with_builtin_languages(settings.max_file_size)
            .context("initializing language parsers")?,
    );
    let builder = Arc::new(CkgBuilder::new(
        Arc::clone(&graph),
        registry,
        settings.batch_size,
        settings.batch_entity_limit,
        settings.parse_concurrency,
    ));
    let updater = Arc::new(IncrementalUpdater::new(
        Arc::clone(&graph),
        Arc::clone(&builder),
        settings.max_placeholder_fraction,
    ));
    let findings = Arc::new(MemoryFindingStore::new());
    let engine = Arc::new(PromptEngine::new(
        settings.prompt_dir.as_deref().map(std::path::Path::new),
    ));
    let llm = LlmClient::new(engine, settings.llm.max_attempts);
    let deps = WorkerDeps {
        queue,
        graph,
        fetcher,
        requests: Arc::new(MemoryRequestStore::new()),
        findings: Arc::clone(&findings) as Arc<dyn FindingStore>,
        builder,
        updater,
        backends: Arc::new(HttpBackendFactory::new(Arc::clone(settings))),
    };
    Ok((
        Arc::new(AnalysisWorker::new(Arc::clone(settings), deps, llm)),
        findings,
    ))
}

async fn run_worker(settings: Arc<Settings>, jobs_path: PathBuf) -> Result<()> {
    let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(
        settings.queue_visibility_timeout_secs,
    )));
    let raw = std::fs::read_to_string(&jobs_path)
        .with_context(|| format!("reading jobs from {}", jobs_path.display()))?;
    let mut enqueued = 0usize;
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let job: AnalysisJob =
            serde_json::from_str(line).context("parsing job envelope")?;
        queue.enqueue(job).await.context("enqueueing job")?;
        enqueued += 1;
    }
    info!(enqueued, "job envelopes loaded");

    let (worker, _findings) = pipeline(
        &settings,
        Arc::new(GitFetcher::new()),
        Arc::clone(&queue) as Arc<dyn JobQueue>,
    )
    .await?;
    let shutdown = CancelToken::new();
    let pool = tokio::spawn(Arc::clone(&worker).run_pool(shutdown.clone()));

    // Drain-and-exit: this binary mode exists for operational testing; a
    // broker-backed queue implementation keeps the pool running instead.
    loop {
        let stats = queue.stats().await;
        if stats.pending == 0 && stats.in_flight == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    shutdown.cancel();
    let _ = pool.await;
    Ok(())
}

async fn run_scan(
    settings: Arc<Settings>,
    path: PathBuf,
    project_id: String,
    no_llm: bool,
) -> Result<()> {
    if no_llm {
        return run_overview(settings, path, project_id).await;
    }
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new(Duration::from_secs(
        settings.queue_visibility_timeout_secs,
    )));
    let (worker, findings) =
        pipeline(&settings, Arc::new(PathFetcher::new(&path)), queue).await?;

    let job = AnalysisJob::new(
        JobKind::FullScan,
        project_id,
        RepoRef {
            url: path.to_string_lossy().into_owned(),
            branch: "local".to_string(),
            commit: None,
            pr: None,
        },
    );
    let request = worker.process_job(&job, &CancelToken::new()).await;
    info!(status = ?request.status, "scan finished");
    for finding in findings.for_request(job.job_id).await? {
        println!(
            "[{}] {} {}: {}",
            finding.severity.as_str(),
            finding.file_path,
            finding
                .line_start
                .map(|l| format!("L{l}"))
                .unwrap_or_default(),
            finding.message
        );
        if let Some(raw) = finding.raw_llm_content {
            println!("--- raw model output ---\n{raw}");
        }
    }
    if let Some(error) = request.error_message {
        anyhow::bail!("analysis failed: {error}");
    }
    Ok(())
}

async fn run_overview(settings: Arc<Settings>, path: PathBuf, project_id: String) -> Result<()> {
    let graph = graph_backend(&settings).await?;
    let registry = Arc::new(
        ParserRegistry::with_builtin_languages(settings.max_file_size)
            .context("initializing language parsers")?,
    );
    let builder = CkgBuilder::new(
        Arc::clone(&graph),
        registry,
        settings.batch_size,
        settings.batch_entity_limit,
        settings.parse_concurrency,
    );
    let project = ProjectDescriptor::new(project_id, "local scan", "auto");
    let stats = builder
        .build_project(&project, &path, &CancelToken::new())
        .await
        .context("building code knowledge graph")?;
    info!(?stats, "graph built");

    let overview = QueryApi::new(graph)
        .project_overview(&project.graph_id)
        .await
        .context("summarizing project")?;
    println!("{}", serde_json::to_string_pretty(&overview)?);
    Ok(())
}
