//! LLM invocation
//!
//! Renders a prompt template, calls the completion backend with bounded
//! exponential backoff, and validates the reply. A failed strict parse
//! triggers one repair pass: the raw reply and the parsing error go back to
//! the model with the schema, asking for a corrected document. Nothing is
//! ever discarded; the raw reply always travels in the result.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::prompts::PromptEngine;

use super::provider::{CompletionBackend, CompletionRequest, LlmError};
use super::schema::{format_instructions, parse_structured, LlmAnalysisOutput};

/// Error string reported when every transport attempt failed.
pub const LLM_UNREACHABLE: &str = "llm_unreachable";

/// Outcome of one analysis invocation. `raw_content` is always present;
/// `parsed_output` only when validation (possibly after repair) succeeded.
#[derive(Debug, Clone)]
pub struct LlmAnalysisResult {
    pub raw_content: String,
    pub parsed_output: Option<LlmAnalysisOutput>,
    pub parsing_succeeded: bool,
    pub parsing_error: Option<String>,
    pub coercion_warnings: Vec<String>,
    pub provider_name: String,
    pub model_name: String,
}

impl LlmAnalysisResult {
    fn unreachable(backend: &dyn CompletionBackend) -> Self {
        Self {
            raw_content: String::new(),
            parsed_output: None,
            parsing_succeeded: false,
            parsing_error: Some(LLM_UNREACHABLE.to_string()),
            coercion_warnings: Vec::new(),
            provider_name: backend.provider_name().to_string(),
            model_name: backend.model_name().to_string(),
        }
    }
}

pub struct LlmClient {
    engine: Arc<PromptEngine>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl LlmClient {
    pub fn new(engine: Arc<PromptEngine>, max_attempts: u32) -> Self {
        Self {
            engine,
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::from_millis(500),
        }
    }

    /// Shorten the backoff; tests use this to keep retries fast.
    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Render `template` with `variables` and run the full
    /// invoke → validate → repair pipeline against `backend`.
    pub async fn invoke(
        &self,
        template: &str,
        variables: &Map<String, Value>,
        backend: &dyn CompletionBackend,
        temperature: f32,
    ) -> Result<LlmAnalysisResult, LlmError> {
        let prompt = self.engine.render(template, variables)?;
        let request = CompletionRequest {
            prompt,
            system: None,
            temperature,
            max_tokens: None,
        };

        let raw_content = match self.complete_with_retry(backend, &request).await {
            Ok(content) => content,
            // Transient exhaustion degrades to "no structured findings";
            // configuration problems (bad key, 4xx) surface to the caller.
            Err(error) if error.is_retryable() => {
                warn!(error = %error, "all completion attempts failed");
                return Ok(LlmAnalysisResult::unreachable(backend));
            }
            Err(error) => return Err(error),
        };
        // The full reply is logged verbatim before any validation touches it.
        info!(
            provider = backend.provider_name(),
            model = backend.model_name(),
            bytes = raw_content.len(),
            raw = %raw_content,
            "raw model reply"
        );

        match parse_structured(&raw_content) {
            Ok((parsed, warnings)) => {
                for warning in &warnings {
                    debug!(warning = %warning, "schema coercion");
                }
                Ok(LlmAnalysisResult {
                    raw_content,
                    parsed_output: Some(parsed),
                    parsing_succeeded: true,
                    parsing_error: None,
                    coercion_warnings: warnings,
                    provider_name: backend.provider_name().to_string(),
                    model_name: backend.model_name().to_string(),
                })
            }
            Err(parse_error) => {
                warn!(error = %parse_error, "strict parse failed, running repair pass");
                self.repair(backend, &request, raw_content, parse_error.to_string())
                    .await
            }
        }
    }

    /// Second chance: the model sees its own reply, the error, and the
    /// schema, and is asked for a corrected document.
    async fn repair(
        &self,
        backend: &dyn CompletionBackend,
        original: &CompletionRequest,
        raw_content: String,
        parse_error: String,
    ) -> Result<LlmAnalysisResult, LlmError> {
        let repair_request = CompletionRequest {
            prompt: format!(
                "Your previous reply could not be parsed.\n\nError: {parse_error}\n\n\
                 Previous reply:\n{raw_content}\n\n\
                 {instructions}\n\nReturn only the corrected JSON document.",
                instructions = format_instructions()
            ),
            system: None,
            temperature: original.temperature,
            max_tokens: None,
        };
        let repaired = match self.complete_with_retry(backend, &repair_request).await {
            Ok(content) => content,
            Err(error) => {
                warn!(error = %error, "repair pass unreachable");
                // The first reply is still the one worth preserving.
                return Ok(LlmAnalysisResult {
                    raw_content,
                    parsed_output: None,
                    parsing_succeeded: false,
                    parsing_error: Some(parse_error),
                    coercion_warnings: Vec::new(),
                    provider_name: backend.provider_name().to_string(),
                    model_name: backend.model_name().to_string(),
                });
            }
        };
        match parse_structured(&repaired) {
            Ok((parsed, warnings)) => {
                info!("repair pass produced a valid document");
                Ok(LlmAnalysisResult {
                    raw_content,
                    parsed_output: Some(parsed),
                    parsing_succeeded: true,
                    parsing_error: None,
                    coercion_warnings: warnings,
                    provider_name: backend.provider_name().to_string(),
                    model_name: backend.model_name().to_string(),
                })
            }
            Err(repair_error) => {
                warn!(error = %repair_error, "repair pass also failed to parse");
                Ok(LlmAnalysisResult {
                    raw_content,
                    parsed_output: None,
                    parsing_succeeded: false,
                    parsing_error: Some(format!(
                        "parse error: {parse_error}; repair error: {repair_error}"
                    )),
                    coercion_warnings: Vec::new(),
                    provider_name: backend.provider_name().to_string(),
                    model_name: backend.model_name().to_string(),
                })
            }
        }
    }

    /// Bounded exponential backoff over transient failures.
    async fn complete_with_retry(
        &self,
        backend: &dyn CompletionBackend,
        request: &CompletionRequest,
    ) -> Result<String, LlmError> {
        let mut delay = self.base_backoff;
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match backend.complete(request).await {
                Ok(content) => return Ok(content),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "completion attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or(LlmError::Unreachable {
            detail: "retries exhausted".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted backend: pops canned responses in order.
    struct ScriptedBackend {
        replies: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err(LlmError::Unreachable {
                    detail: "script exhausted".to_string(),
                })
            } else {
                replies.remove(0)
            }
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "test-model"
        }
    }

    fn client() -> LlmClient {
        LlmClient::new(Arc::new(PromptEngine::new(None)), 3)
            .with_base_backoff(Duration::from_millis(1))
    }

    fn full_scan_variables() -> Map<String, Value> {
        let engine = PromptEngine::new(None);
        let template = engine
            .get(crate::prompts::FULL_PROJECT_ARCHITECTURE)
            .unwrap();
        let mut variables = Map::new();
        for name in &template.variables {
            variables.insert(name.clone(), json!("x"));
        }
        variables
    }

    #[tokio::test]
    async fn valid_reply_parses_first_try() {
        let backend = ScriptedBackend::new(vec![Ok(
            r#"{"findings":[{"file_path":"a.py","severity":"Error","message":"boom"}]}"#
                .to_string(),
        )]);
        let result = client()
            .invoke(
                crate::prompts::FULL_PROJECT_ARCHITECTURE,
                &full_scan_variables(),
                &backend,
                0.1,
            )
            .await
            .unwrap();
        assert!(result.parsing_succeeded);
        assert_eq!(result.parsed_output.unwrap().findings.len(), 1);
    }

    #[tokio::test]
    async fn repair_pass_recovers_malformed_reply() {
        let backend = ScriptedBackend::new(vec![
            Ok("findings are: broken ] json [".to_string()),
            Ok(r#"{"findings":[]}"#.to_string()),
        ]);
        let result = client()
            .invoke(
                crate::prompts::FULL_PROJECT_ARCHITECTURE,
                &full_scan_variables(),
                &backend,
                0.1,
            )
            .await
            .unwrap();
        assert!(result.parsing_succeeded);
        // The raw content is still the first, unrepaired reply.
        assert!(result.raw_content.contains("broken"));
    }

    #[tokio::test]
    async fn prose_only_reply_survives_as_raw_content() {
        let prose = "No JSON here, just thoughts about the code.";
        let backend = ScriptedBackend::new(vec![
            Ok(prose.to_string()),
            Ok("still not json".to_string()),
        ]);
        let result = client()
            .invoke(
                crate::prompts::FULL_PROJECT_ARCHITECTURE,
                &full_scan_variables(),
                &backend,
                0.1,
            )
            .await
            .unwrap();
        assert!(!result.parsing_succeeded);
        assert_eq!(result.raw_content, prose);
        assert!(result.parsing_error.is_some());
    }

    #[tokio::test]
    async fn transport_exhaustion_reports_llm_unreachable() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Unreachable {
                detail: "t1".into(),
            }),
            Err(LlmError::Rejected { status: 503 }),
            Err(LlmError::Unreachable {
                detail: "t3".into(),
            }),
        ]);
        let result = client()
            .invoke(
                crate::prompts::FULL_PROJECT_ARCHITECTURE,
                &full_scan_variables(),
                &backend,
                0.1,
            )
            .await
            .unwrap();
        assert!(!result.parsing_succeeded);
        assert_eq!(result.raw_content, "");
        assert_eq!(result.parsing_error.as_deref(), Some(LLM_UNREACHABLE));
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Rejected { status: 401 }),
            Ok(r#"{"findings":[]}"#.to_string()),
        ]);
        let err = client()
            .invoke(
                crate::prompts::FULL_PROJECT_ARCHITECTURE,
                &full_scan_variables(),
                &backend,
                0.1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Rejected { status: 401 }));
    }
}
