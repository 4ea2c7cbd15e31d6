//! Completion backends
//!
//! Three providers behind one capability: a local model server, hosted chat
//! API A, and hosted chat API B. Provider-specific request and response
//! shapes live entirely in this module; callers see
//! `complete(request) -> String` and nothing else.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmDefaults;
use crate::models::{LlmProviderConfig, ProviderKind};
use crate::prompts::PromptError;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm_unreachable: {detail}")]
    Unreachable { detail: String },

    #[error("provider rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("no API key configured for provider {provider}")]
    MissingKey { provider: &'static str },

    #[error("malformed provider response: {detail}")]
    MalformedResponse { detail: String },

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

impl LlmError {
    /// Transient failures worth another attempt: network errors, timeouts,
    /// and server-side 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Unreachable { .. } => true,
            LlmError::Rejected { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Everything one completion call needs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    fn provider_name(&self) -> &'static str;

    fn model_name(&self) -> &str;
}

/// HTTP-backed completion client covering all three provider dialects.
pub struct HttpCompletionBackend {
    kind: ProviderKind,
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletionBackend {
    /// Resolve a backend from the job's provider config plus the process
    /// defaults. The per-project key override wins; neither is mutated.
    pub fn from_config(
        config: &LlmProviderConfig,
        defaults: &LlmDefaults,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::Unreachable {
                detail: e.to_string(),
            })?;
        let (base_url, model, api_key) = match config.provider {
            ProviderKind::Local => (
                defaults.local_base_url.clone(),
                config.model.clone().unwrap_or_else(|| defaults.local_model.clone()),
                None,
            ),
            ProviderKind::HostedA => {
                let key = config
                    .api_key
                    .clone()
                    .or_else(|| defaults.hosted_a_api_key.clone())
                    .ok_or(LlmError::MissingKey {
                        provider: "hosted_a",
                    })?;
                (
                    "https://api.openai.com".to_string(),
                    config
                        .model
                        .clone()
                        .unwrap_or_else(|| defaults.hosted_a_model.clone()),
                    Some(key),
                )
            }
            ProviderKind::HostedB => {
                let key = config
                    .api_key
                    .clone()
                    .or_else(|| defaults.hosted_b_api_key.clone())
                    .ok_or(LlmError::MissingKey {
                        provider: "hosted_b",
                    })?;
                (
                    "https://generativelanguage.googleapis.com".to_string(),
                    config
                        .model
                        .clone()
                        .unwrap_or_else(|| defaults.hosted_b_model.clone()),
                    Some(key),
                )
            }
        };
        Ok(Self {
            kind: config.provider,
            client,
            base_url,
            model,
            api_key,
        })
    }

    /// Point the backend at a different server; used for self-hosted
    /// OpenAI-compatible gateways and for tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post(&self, url: String, body: Value, bearer: Option<&str>) -> Result<Value, LlmError> {
        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        debug!(provider = self.provider_name(), model = %self.model, "sending completion request");
        let response = request.send().await.map_err(|e| LlmError::Unreachable {
            detail: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Rejected {
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(|e| LlmError::MalformedResponse {
            detail: e.to_string(),
        })
    }

    fn text_at<'a>(value: &'a Value, path: &[&str]) -> Result<&'a str, LlmError> {
        let mut current = value;
        for segment in path {
            current = match segment.parse::<usize>() {
                Ok(index) => current.get(index),
                Err(_) => current.get(segment),
            }
            .ok_or_else(|| LlmError::MalformedResponse {
                detail: format!("missing field {segment:?} in provider reply"),
            })?;
        }
        current.as_str().ok_or_else(|| LlmError::MalformedResponse {
            detail: "reply text is not a string".to_string(),
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let base = self.base_url.trim_end_matches('/');
        match self.kind {
            ProviderKind::Local => {
                let mut messages = Vec::new();
                if let Some(system) = &request.system {
                    messages.push(json!({ "role": "system", "content": system }));
                }
                messages.push(json!({ "role": "user", "content": request.prompt }));
                let body = json!({
                    "model": self.model,
                    "messages": messages,
                    "stream": false,
                    "options": { "temperature": request.temperature },
                });
                let reply = self.post(format!("{base}/api/chat"), body, None).await?;
                Ok(Self::text_at(&reply, &["message", "content"])?.to_string())
            }
            ProviderKind::HostedA => {
                let mut messages = Vec::new();
                if let Some(system) = &request.system {
                    messages.push(json!({ "role": "system", "content": system }));
                }
                messages.push(json!({ "role": "user", "content": request.prompt }));
                let mut body = json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": request.temperature,
                });
                if let Some(max_tokens) = request.max_tokens {
                    body["max_tokens"] = json!(max_tokens);
                }
                let reply = self
                    .post(
                        format!("{base}/v1/chat/completions"),
                        body,
                        self.api_key.as_deref(),
                    )
                    .await?;
                Ok(
                    Self::text_at(&reply, &["choices", "0", "message", "content"])?
                        .to_string(),
                )
            }
            ProviderKind::HostedB => {
                let key = self.api_key.as_deref().ok_or(LlmError::MissingKey {
                    provider: "hosted_b",
                })?;
                let text = match &request.system {
                    Some(system) => format!("{system}\n\n{}", request.prompt),
                    None => request.prompt.clone(),
                };
                let body = json!({
                    "contents": [{ "parts": [{ "text": text }] }],
                    "generationConfig": { "temperature": request.temperature },
                });
                let url = format!(
                    "{base}/v1beta/models/{model}:generateContent?key={key}",
                    model = self.model
                );
                let reply = self.post(url, body, None).await?;
                Ok(Self::text_at(
                    &reply,
                    &["candidates", "0", "content", "parts", "0", "text"],
                )?
                .to_string())
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        match self.kind {
            ProviderKind::Local => "local",
            ProviderKind::HostedA => "hosted_a",
            ProviderKind::HostedB => "hosted_b",
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
