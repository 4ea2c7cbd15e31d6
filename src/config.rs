//! Process-wide configuration
//!
//! All tunables are read from the environment once at startup and are
//! immutable afterwards. Per-project overrides (LLM provider, API key) travel
//! inside the job payload and never mutate these settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Default ceiling for a single source file, in bytes. Larger files are
/// recorded with an `oversize` note and skipped by the parsers.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_048_576;

/// Default number of files collected into one graph write batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default entity ceiling per batch; a batch is flushed early when reached.
pub const DEFAULT_BATCH_ENTITY_LIMIT: usize = 10_000;

/// Graph store connection settings, read from the `NEO4J_*` environment
/// contract. The in-memory backend ignores these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStoreConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            username: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
        }
    }
}

/// Defaults for the LLM invocation layer. A job may override provider, model,
/// temperature, and key through its `llm_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDefaults {
    pub temperature: f32,
    pub max_attempts: u32,
    pub local_base_url: String,
    pub local_model: String,
    pub hosted_a_model: String,
    pub hosted_b_model: String,
    /// Process-wide API keys; `None` means the provider requires a
    /// per-project override.
    pub hosted_a_api_key: Option<String>,
    pub hosted_b_api_key: Option<String>,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_attempts: 3,
            local_base_url: "http://localhost:11434".to_string(),
            local_model: "qwen2.5-coder:7b".to_string(),
            hosted_a_model: "gpt-4o-mini".to_string(),
            hosted_b_model: "gemini-1.5-flash".to_string(),
            hosted_a_api_key: None,
            hosted_b_api_key: None,
        }
    }
}

/// Immutable process configuration assembled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub graph: GraphStoreConfig,
    pub llm: LlmDefaults,

    /// Files collected per graph write batch.
    pub batch_size: usize,
    /// Entity ceiling per batch; flushes the batch early.
    pub batch_entity_limit: usize,
    /// Per-file size ceiling in bytes.
    pub max_file_size: u64,

    /// Worker tasks pulling from the job queue.
    pub max_workers: usize,
    /// Upper bound on jobs in flight across all workers.
    pub max_concurrent_analyses: usize,
    /// Job deadline in seconds; every suspension point honors it.
    pub analysis_timeout_secs: u64,
    /// Concurrent file parses within one build.
    pub parse_concurrency: usize,

    /// Unacknowledged jobs become redeliverable after this many seconds.
    pub queue_visibility_timeout_secs: u64,

    /// Placeholder classes may not exceed this fraction of all classes after
    /// an incremental update.
    pub max_placeholder_fraction: f64,

    /// Directory holding the prompt template files.
    pub prompt_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            graph: GraphStoreConfig::default(),
            llm: LlmDefaults::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_entity_limit: DEFAULT_BATCH_ENTITY_LIMIT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_workers: 4,
            max_concurrent_analyses: 8,
            analysis_timeout_secs: 300,
            parse_concurrency: cores * 2,
            queue_visibility_timeout_secs: 120,
            max_placeholder_fraction: 0.5,
            prompt_dir: None,
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults
    /// for anything unset. Malformed numeric values are an error rather than
    /// a silent fallback.
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();

        if let Ok(uri) = env::var("NEO4J_URI") {
            settings.graph.uri = uri;
        }
        if let Ok(user) = env::var("NEO4J_USERNAME") {
            settings.graph.username = user;
        }
        if let Ok(pass) = env::var("NEO4J_PASSWORD") {
            settings.graph.password = pass;
        }
        if let Ok(db) = env::var("NEO4J_DATABASE") {
            settings.graph.database = db;
        }

        if let Some(v) = parse_env::<usize>("CKG_BATCH_SIZE")? {
            settings.batch_size = v;
        }
        if let Some(v) = parse_env::<u64>("CKG_MAX_FILE_SIZE")? {
            settings.max_file_size = v;
        }
        if let Some(v) = parse_env::<usize>("MAX_ANALYSIS_WORKERS")? {
            settings.max_workers = v;
        }
        if let Some(v) = parse_env::<usize>("MAX_CONCURRENT_ANALYSES")? {
            settings.max_concurrent_analyses = v;
        }
        if let Some(v) = parse_env::<u64>("ANALYSIS_TIMEOUT")? {
            settings.analysis_timeout_secs = v;
        }
        if let Some(v) = parse_env::<usize>("PARSE_CONCURRENCY")? {
            settings.parse_concurrency = v;
        }
        if let Some(v) = parse_env::<u64>("QUEUE_VISIBILITY_TIMEOUT")? {
            settings.queue_visibility_timeout_secs = v;
        }
        if let Some(v) = parse_env::<f64>("MAX_PLACEHOLDER_FRACTION")? {
            settings.max_placeholder_fraction = v;
        }
        if let Some(v) = parse_env::<f32>("LLM_DEFAULT_TEMPERATURE")? {
            settings.llm.temperature = v;
        }
        if let Some(v) = parse_env::<u32>("LLM_MAX_ATTEMPTS")? {
            settings.llm.max_attempts = v;
        }

        if let Ok(url) = env::var("LLM_LOCAL_BASE_URL") {
            settings.llm.local_base_url = url;
        }
        if let Ok(model) = env::var("LLM_LOCAL_MODEL") {
            settings.llm.local_model = model;
        }
        if let Ok(model) = env::var("LLM_HOSTED_A_MODEL") {
            settings.llm.hosted_a_model = model;
        }
        if let Ok(model) = env::var("LLM_HOSTED_B_MODEL") {
            settings.llm.hosted_b_model = model;
        }
        settings.llm.hosted_a_api_key = env::var("LLM_HOSTED_A_API_KEY").ok();
        settings.llm.hosted_b_api_key = env::var("LLM_HOSTED_B_API_KEY").ok();

        if let Ok(dir) = env::var("VIGIL_PROMPT_DIR") {
            settings.prompt_dir = Some(dir);
        }

        Ok(settings)
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.max_file_size, 1_048_576);
        assert_eq!(settings.analysis_timeout_secs, 300);
        assert!((settings.llm.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(settings.llm.max_attempts, 3);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        std::env::set_var("VIGIL_TEST_BAD_NUMBER", "not-a-number");
        let result = parse_env::<usize>("VIGIL_TEST_BAD_NUMBER");
        std::env::remove_var("VIGIL_TEST_BAD_NUMBER");
        assert!(result.is_err());
    }

    #[test]
    fn parse_env_absent_is_none() {
        assert!(parse_env::<usize>("VIGIL_TEST_UNSET_KEY")
            .unwrap()
            .is_none());
    }
}
