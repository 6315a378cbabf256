//! Provider and model configuration data types.
//!
//! These are plain, hand-constructed structs: no TOML/YAML/JSON-schema
//! parsing dependency is introduced here, matching the host crate's own
//! [`CloudLLMConfig`](https://docs.rs/cloudllm)-style precedent of "users
//! build the config, we don't load it." The configuration file loader is an
//! external collaborator (spec §1) that is expected to construct these
//! types, not something this crate provides.

use serde::{Deserialize, Serialize};

/// The adapter family a [`ProviderConfig`] resolves to via the registry
/// (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTag {
    Openai,
    Generic,
    Mistral,
    Groq,
    Huggingface,
    Ollama,
    Llamacpp,
    Cerebras,
    Qwen,
    Antigravity,
}

/// Everything an adapter constructor needs to talk to one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub backend: BackendTag,
    pub api_base: Option<String>,
    pub api_key_env_var: Option<String>,
}

/// One model offered by a provider.
///
/// `alias` defaults to `name` when not given explicitly (mirrors the
/// original implementation's `alias` validator): `name` is the
/// provider-facing identifier, `alias` is what the user sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    pub alias: String,
    pub temperature: f32,
    pub input_price: f64,
    pub output_price: f64,
    pub context: Option<u32>,
    pub max_output: Option<u32>,
}

impl ModelConfig {
    /// Constructs a `ModelConfig`, defaulting `alias` to `name` when `alias`
    /// is `None`.
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        alias: Option<String>,
        temperature: f32,
    ) -> Self {
        let name = name.into();
        let alias = alias.unwrap_or_else(|| name.clone());
        Self {
            name,
            provider: provider.into(),
            alias,
            temperature,
            input_price: 0.0,
            output_price: 0.0,
            context: None,
            max_output: None,
        }
    }
}

/// The built-in model catalogue a configuration file loader may fall back
/// on before any user override is applied. Supplements the distilled spec
/// with the original implementation's `DEFAULT_MODELS` table (placeholder
/// pricing, a representative spread across providers).
pub fn default_models() -> Vec<ModelConfig> {
    vec![
        ModelConfig::new("gpt-4.1", "openai", None, 0.2),
        ModelConfig::new("gpt-4.1-mini", "openai", None, 0.2),
        ModelConfig::new("claude-sonnet-4", "anthropic", None, 0.2),
        ModelConfig::new("llama-3.3-70b-versatile", "groq", None, 0.2),
        ModelConfig::new("mistral-large-latest", "mistral", None, 0.2),
        ModelConfig::new("llama3", "ollama", Some("local-llama3".into()), 0.2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_defaults_to_name() {
        let m = ModelConfig::new("gpt-4.1", "openai", None, 0.2);
        assert_eq!(m.alias, "gpt-4.1");
    }

    #[test]
    fn alias_explicit_override_kept() {
        let m = ModelConfig::new("gpt-4.1", "openai", Some("fast".into()), 0.2);
        assert_eq!(m.alias, "fast");
        assert_eq!(m.name, "gpt-4.1");
    }

    #[test]
    fn default_models_nonempty() {
        assert!(!default_models().is_empty());
    }
}
