//! Provider-agnostic LLM backend layer for an interactive coding-agent CLI.
//!
//! This crate normalises several mutually-incompatible provider wire formats
//! (OpenAI-compatible JSON, Gemini-style `contents`/`parts`, Qwen-Code's
//! inline `<think>` reasoning) into one message model, streams partial
//! responses with tool-call deltas, and manages OAuth credentials where a
//! provider doesn't take a static API key. The terminal UI, configuration
//! file loader, and concrete tool implementations are external collaborators
//! and are not part of this crate.

pub mod llm;

pub use llm::adapter::{Adapter, ToolChoice};
pub use llm::config::{default_models, BackendTag, ModelConfig, ProviderConfig};
pub use llm::error::BackendError;
pub use llm::message::{AvailableTool, Chunk, FunctionCall, Message, Role, ToolCall, Usage};
pub use llm::registry::{OAuthPaths, Registry, DEFAULT_REGISTRY};

/// Initializes `env_logger` with a sane default filter if one hasn't already
/// been set via `RUST_LOG`. Safe to call more than once; later calls are
/// no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}
