//! The uniform provider adapter contract (C4).
//!
//! Grounded on the host crate's `ClientWrapper` trait shape
//! (`#[async_trait]`, owned async methods over `&self`), generalized to the
//! five operations every backend in this crate must expose.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::llm::config::ModelConfig;
use crate::llm::error::BackendError;
use crate::llm::message::{AvailableTool, Chunk, Message};

/// Canonical tool-choice selection, translated per provider family (spec
/// §4.4 table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Specific(String),
}

impl ToolChoice {
    /// OpenAI-family wire representation.
    pub fn to_openai_value(&self) -> serde_json::Value {
        match self {
            ToolChoice::Auto => serde_json::json!("auto"),
            ToolChoice::None => serde_json::json!("none"),
            ToolChoice::Required => serde_json::json!("required"),
            ToolChoice::Specific(name) => serde_json::json!({
                "type": "function",
                "function": {"name": name},
            }),
        }
    }

    /// Gemini-family wire representation (`toolConfig.functionCallingConfig`).
    pub fn to_gemini_value(&self) -> serde_json::Value {
        match self {
            ToolChoice::Auto => serde_json::json!({"mode": "AUTO"}),
            ToolChoice::None => serde_json::json!({"mode": "NONE"}),
            ToolChoice::Required => serde_json::json!({"mode": "REQUIRED"}),
            ToolChoice::Specific(name) => serde_json::json!({
                "mode": "ANY",
                "allowedFunctionNames": [name],
            }),
        }
    }
}

/// A lazy, finite, non-restartable sequence of streaming [`Chunk`]s.
pub type ChunkStream<'a> = BoxStream<'a, Result<Chunk, BackendError>>;

/// The contract every concrete backend (C5/C6/C7) implements.
///
/// Implementors acquire their HTTP client (and, where relevant, OAuth
/// manager) at construction time and hold them for the adapter's lifetime;
/// `Drop` releases pooled connections on every exit path.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// One-shot, non-streaming completion.
    async fn complete(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        extra_headers: Option<&[(String, String)]>,
    ) -> Result<Chunk, BackendError>;

    /// Streaming completion: a lazy, finite sequence of `Chunk`s, delivered
    /// in the exact order the server sent them.
    async fn complete_streaming<'a>(
        &'a self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        extra_headers: Option<&[(String, String)]>,
    ) -> Result<ChunkStream<'a>, BackendError>;

    /// Counts prompt tokens for a would-be request. The default
    /// implementation issues a `max_tokens=1` completion and reads
    /// `usage.prompt_tokens`, failing with `PayloadError` if the provider
    /// reports no usage at all; adapters with a cheaper native endpoint may
    /// override this.
    async fn count_tokens(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
    ) -> Result<u32, BackendError> {
        let chunk = self
            .complete(model, messages, temperature, None, Some(1), None, None)
            .await?;
        chunk
            .usage
            .map(|u| u.prompt_tokens)
            .ok_or_else(|| BackendError::payload(Default::default(), "missing usage"))
    }

    /// Lists models this backend can serve: dynamic for providers with a
    /// models/tags endpoint, static for cloud providers publishing a fixed
    /// catalogue. Never fails outright — backends without a meaningful
    /// listing return an empty vector.
    async fn list_models(&self) -> Vec<String>;

    /// A short identifier for this adapter's backend, used in error
    /// context and logs.
    fn backend_name(&self) -> &'static str;
}
