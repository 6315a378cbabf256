//! The backend registry (C8): maps a [`BackendTag`] to the adapter
//! constructor for it. No dynamic discovery — adding a provider is a
//! registry entry plus an adapter conforming to [`Adapter`] (C4).
//!
//! Grounded on `original_source/revibe/core/llm/backend/factory.py`'s
//! `BACKEND_FACTORY` dict for the registry-as-static-map design, expressed
//! as a strongly-typed match rather than a dynamic dict-of-classes (spec
//! §9: "a tagged registry keyed by `BackendTag`" replaces the source's
//! duck-typed dispatch). Resolution happens once per request; the registry
//! itself holds no state beyond the default Antigravity/Qwen OAuth paths,
//! and is the one process-wide datum this crate defines (spec §5/§9).

use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::llm::adapter::Adapter;
use crate::llm::backend::antigravity::AntigravityAdapter;
use crate::llm::backend::openai_compatible::OpenAiCompatibleAdapter;
use crate::llm::backend::qwen::QwenAdapter;
use crate::llm::config::{BackendTag, ProviderConfig};
use crate::llm::error::BackendError;

/// Where OAuth credential files live by default, overridable per call to
/// [`Registry::build`]. Mirrors the platform-standard config directory
/// convention spec §4.3/§6 describes ("OS-specific config dir").
fn default_oauth_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("revibe")
}

/// Overridable OAuth credential file locations and Antigravity defaults
/// that the registry threads through to the two OAuth-backed adapters.
#[derive(Debug, Clone)]
pub struct OAuthPaths {
    pub qwen_credentials_path: PathBuf,
    pub antigravity_credentials_path: PathBuf,
    pub antigravity_default_project_id: Option<String>,
    pub antigravity_endpoint: Option<String>,
}

impl Default for OAuthPaths {
    fn default() -> Self {
        let dir = default_oauth_dir();
        Self {
            qwen_credentials_path: dir.join("qwen_oauth_creds.json"),
            antigravity_credentials_path: dir.join("antigravity_oauth_creds.json"),
            antigravity_default_project_id: None,
            antigravity_endpoint: None,
        }
    }
}

/// The read-only, process-wide registry: `BackendTag` → adapter
/// constructor. Built once at startup (spec §9); every `build` call below
/// constructs a fresh adapter instance per request rather than sharing one,
/// since adapters own a scoped HTTP client (spec §5).
#[derive(Debug, Clone, Default)]
pub struct Registry {
    oauth_paths: OAuthPaths,
}

impl Registry {
    pub fn new(oauth_paths: OAuthPaths) -> Self {
        Self { oauth_paths }
    }

    /// Resolves `provider.backend` to a concrete adapter. This is the one
    /// lookup the rest of the application needs (spec §6: "A single lookup
    /// `registry[BackendTag] → AdapterCtor(provider_config, timeout?) →
    /// Adapter`").
    pub fn build(&self, provider: &ProviderConfig) -> Result<Arc<dyn Adapter>, BackendError> {
        match provider.backend {
            BackendTag::Openai
            | BackendTag::Generic
            | BackendTag::Mistral
            | BackendTag::Groq
            | BackendTag::Huggingface
            | BackendTag::Ollama
            | BackendTag::Llamacpp
            | BackendTag::Cerebras => {
                Ok(Arc::new(OpenAiCompatibleAdapter::new(provider)?))
            }
            BackendTag::Qwen => Ok(Arc::new(QwenAdapter::new(
                provider,
                self.oauth_paths.qwen_credentials_path.clone(),
            )?)),
            BackendTag::Antigravity => Ok(Arc::new(AntigravityAdapter::new(
                self.oauth_paths.antigravity_credentials_path.clone(),
                self.oauth_paths.antigravity_default_project_id.clone(),
                self.oauth_paths.antigravity_endpoint.clone(),
            )?)),
        }
    }
}

lazy_static! {
    /// The registry built with every OAuth path left at its default (spec
    /// §9: "the backend registry is the only process-wide datum; initialise
    /// once at startup, treat as read-only"). Callers with non-default
    /// credential paths build their own `Registry` instance instead of using
    /// this one.
    pub static ref DEFAULT_REGISTRY: Registry = Registry::default();
}
