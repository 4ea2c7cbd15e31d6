//! Provider-agnostic LLM invocation
//!
//! Completion backends ([`provider`]), reply validation and coercion
//! ([`schema`]), and the invoke/repair pipeline ([`client`]).

pub mod client;
pub mod provider;
pub mod schema;

pub use client::{LlmAnalysisResult, LlmClient, LLM_UNREACHABLE};
pub use provider::{CompletionBackend, CompletionRequest, HttpCompletionBackend, LlmError};
pub use schema::{format_instructions, LlmAnalysisOutput, LlmFinding};
