//! The generic OpenAI-compatible adapter (C5): OpenAI, Groq, Cerebras,
//! Ollama, HuggingFace, Mistral, llama.cpp — anything speaking
//! `/chat/completions`.
//!
//! Grounded on `clients/common.rs`'s `send_with_native_tools` (the
//! teacher's one raw-`reqwest` JSON request/response path, as opposed to
//! its SDK-delegating paths) for the manual request/response shape, and
//! `clients/openai.rs` for the adapter struct shape. The Ollama override is
//! grounded on `original_source/revibe/core/llm/backend/ollama.py`.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::adapter::{Adapter, ChunkStream, ToolChoice};
use crate::llm::config::{BackendTag, ModelConfig, ProviderConfig};
use crate::llm::error::{BackendError, ErrorContext};
use crate::llm::http::{build_client, build_probe_client, DEFAULT_REQUEST_TIMEOUT};
use crate::llm::message::{AvailableTool, Chunk, FunctionCall, Message, MessageDelta, Role, ToolCall, Usage};
use crate::llm::streaming::{decode_json_frame, frame_error, is_event_stream, parse_sse_field, split_sse_lines};

fn default_base_url(tag: BackendTag) -> Option<&'static str> {
    match tag {
        BackendTag::Openai => Some("https://api.openai.com/v1"),
        BackendTag::Groq => Some("https://api.groq.com/openai/v1"),
        BackendTag::Mistral => Some("https://api.mistral.ai/v1"),
        BackendTag::Cerebras => Some("https://api.cerebras.ai/v1"),
        BackendTag::Huggingface => Some("https://api-inference.huggingface.co/v1"),
        BackendTag::Ollama => Some("http://localhost:11434/v1"),
        BackendTag::Llamacpp => Some("http://localhost:8080/v1"),
        BackendTag::Generic => None,
        _ => None,
    }
}

/// Concrete adapter for every OpenAI-shaped `/chat/completions` provider.
pub struct OpenAiCompatibleAdapter {
    backend_tag: BackendTag,
    api_base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(provider: &ProviderConfig) -> Result<Self, BackendError> {
        let api_base = provider
            .api_base
            .clone()
            .or_else(|| default_base_url(provider.backend).map(str::to_string))
            .ok_or_else(|| {
                BackendError::config(format!(
                    "provider '{}' has no api_base and backend {:?} has no default",
                    provider.name, provider.backend
                ))
            })?
            .trim_end_matches('/')
            .to_string();

        let api_key = provider
            .api_key_env_var
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        let http = build_client(DEFAULT_REQUEST_TIMEOUT)
            .map_err(|e| BackendError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            backend_tag: provider.backend,
            api_base,
            api_key,
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn ctx(&self, model: &str) -> ErrorContext {
        ErrorContext {
            provider: format!("{:?}", self.backend_tag),
            endpoint: self.endpoint(),
            model: model.to_string(),
            status: None,
            body_excerpt: None,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn build_body(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model.name,
            "messages": messages.iter().map(message_to_openai).collect::<Vec<_>>(),
            "temperature": temperature,
            "stream": stream,
        });
        if let Some(tools) = tools {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                }))
                .collect::<Vec<_>>());
        }
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(choice) = tool_choice {
            body["tool_choice"] = choice.to_openai_value();
        }
        body
    }
}

fn message_to_openai(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut out = json!({
        "role": role,
        "content": msg.content.clone().unwrap_or_default(),
    });
    if !msg.tool_calls.is_empty() {
        out["tool_calls"] = json!(msg
            .tool_calls
            .iter()
            .map(|tc| json!({
                "id": tc.id,
                "type": "function",
                "function": {
                    "name": tc.function.name,
                    "arguments": tc.function.arguments.clone().unwrap_or_default(),
                },
            }))
            .collect::<Vec<_>>());
    }
    if let Some(call_id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(call_id);
    }
    out
}

fn parse_non_streaming_response(body: &Value) -> (MessageDelta, Option<Usage>) {
    let choice = &body["choices"][0];
    let message = &choice["message"];
    let content = message["content"].as_str().map(str::to_string);
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, tc)| ToolCall {
                    id: tc["id"].as_str().map(str::to_string),
                    index: tc["index"].as_u64().map(|v| v as u32).unwrap_or(i as u32),
                    function: FunctionCall {
                        name: tc["function"]["name"].as_str().map(str::to_string),
                        arguments: normalize_arguments(&tc["function"]["arguments"]),
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = body.get("usage").map(|u| Usage {
        prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
    });

    (
        MessageDelta {
            content,
            reasoning_content: None,
            tool_calls,
            finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        },
        usage,
    )
}

/// Normalises provider-delivered arguments to string form, whether the
/// provider sent a JSON string or an object (spec §4.1).
fn normalize_arguments(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Decodes one `choices[0].delta.tool_calls` frame entry, taking the
/// provider-supplied `index` verbatim (spec §4.5 — unlike Gemini, OpenAI
/// assigns its own stable index per call).
fn parse_delta_tool_calls(delta: &Value) -> Vec<ToolCall> {
    delta["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc["id"].as_str().map(str::to_string),
                    index: tc["index"].as_u64().unwrap_or(0) as u32,
                    function: FunctionCall {
                        name: tc["function"]["name"].as_str().map(str::to_string),
                        arguments: normalize_arguments(&tc["function"]["arguments"]),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Adapter for OpenAiCompatibleAdapter {
    async fn complete(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        extra_headers: Option<&[(String, String)]>,
    ) -> Result<Chunk, BackendError> {
        let body = self.build_body(model, messages, temperature, tools, max_tokens, tool_choice, false);
        let mut builder = self.request(self.http.post(self.endpoint())).json(&body);
        if let Some(headers) = extra_headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::transport(self.ctx(&model.name), e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), self.ctx(&model.name), Some(body_text)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::transport(self.ctx(&model.name), e))?;
        let (message, usage) = parse_non_streaming_response(&body);
        Ok(Chunk { message, usage })
    }

    async fn complete_streaming<'a>(
        &'a self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        extra_headers: Option<&[(String, String)]>,
    ) -> Result<ChunkStream<'a>, BackendError> {
        let body = self.build_body(model, messages, temperature, tools, max_tokens, tool_choice, true);
        let mut builder = self.request(self.http.post(self.endpoint())).json(&body);
        if let Some(headers) = extra_headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::transport(self.ctx(&model.name), e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !status.is_success() || !is_event_stream(&content_type) {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), self.ctx(&model.name), Some(body_text)));
        }

        let ctx = self.ctx(&model.name);
        let byte_stream = response.bytes_stream();
        let chunk_stream = sse_to_chunks(byte_stream, ctx);
        Ok(Box::pin(chunk_stream))
    }

    async fn list_models(&self) -> Vec<String> {
        if self.backend_tag == BackendTag::Ollama {
            if let Some(models) = self.try_ollama_native_tags().await {
                return models;
            }
        }
        self.list_models_openai_compatible().await.unwrap_or_default()
    }

    fn backend_name(&self) -> &'static str {
        match self.backend_tag {
            BackendTag::Openai => "openai",
            BackendTag::Groq => "groq",
            BackendTag::Mistral => "mistral",
            BackendTag::Cerebras => "cerebras",
            BackendTag::Huggingface => "huggingface",
            BackendTag::Ollama => "ollama",
            BackendTag::Llamacpp => "llamacpp",
            BackendTag::Generic => "generic",
            _ => "openai-compatible",
        }
    }
}

impl OpenAiCompatibleAdapter {
    async fn list_models_openai_compatible(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/models", self.api_base);
        let response = self
            .request(self.http.get(&url))
            .send()
            .await
            .map_err(|e| BackendError::transport(self.ctx(""), e))?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::transport(self.ctx(""), e))?;
        let ids = body["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    /// Tries Ollama's native `/api/tags` with a short timeout distinct from
    /// the adapter's main request timeout; any failure (network, non-2xx,
    /// malformed JSON) means "fall back," never "fail" (spec §4.5
    /// supplement).
    async fn try_ollama_native_tags(&self) -> Option<Vec<String>> {
        let probe = build_probe_client(std::time::Duration::from_secs(5)).ok()?;
        let base = self.api_base.trim_end_matches("/v1").trim_end_matches('/');
        let url = format!("{}/api/tags", base);
        let response = probe.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        let models = body["models"]
            .as_array()?
            .iter()
            .filter_map(|m| m["name"].as_str().map(str::to_string))
            .collect();
        Some(models)
    }
}

/// Turns a raw byte stream into a stream of decoded [`Chunk`]s, applying
/// the shared SSE/JSON-frame primitives from `streaming.rs` (spec §4.9).
fn sse_to_chunks(
    byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ctx: ErrorContext,
) -> impl Stream<Item = Result<Chunk, BackendError>> + Send + 'static {
    async_stream::stream! {
        futures_util::pin_mut!(byte_stream);
        let mut pending = String::new();

        'outer: while let Some(next) = byte_stream.next().await {
            let bytes = match next {
                Ok(b) => b,
                Err(e) => {
                    yield Err(BackendError::transport(ctx.clone(), e));
                    break 'outer;
                }
            };
            pending.push_str(&String::from_utf8_lossy(&bytes));

            let (lines, rest) = split_sse_lines(&pending);
            let owned_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
            let rest = rest.to_string();

            for line in owned_lines {
                let Some((field, value)) = parse_sse_field(&line) else { continue };
                if field != "data" {
                    continue;
                }
                if value.trim() == "[DONE]" {
                    pending = rest.clone();
                    break 'outer;
                }
                let Some(frame) = decode_json_frame(value) else { continue };

                if let Some(err) = frame_error(&frame, ctx.clone()) {
                    yield Err(err);
                    break 'outer;
                }

                let delta = &frame["choices"][0]["delta"];
                let content = delta["content"].as_str().map(str::to_string);
                let tool_calls = parse_delta_tool_calls(delta);
                let finish_reason = frame["choices"][0]["finish_reason"].as_str().map(str::to_string);
                let usage = frame.get("usage").map(|u| Usage {
                    prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                    completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
                });

                if content.is_some() || !tool_calls.is_empty() || finish_reason.is_some() || usage.is_some() {
                    yield Ok(Chunk {
                        message: MessageDelta {
                            content,
                            reasoning_content: None,
                            tool_calls,
                            finish_reason,
                        },
                        usage,
                    });
                }
            }
            pending = rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_arguments_keeps_string_and_stringifies_object() {
        assert_eq!(normalize_arguments(&json!("{\"a\":1}")), Some("{\"a\":1}".to_string()));
        assert_eq!(normalize_arguments(&json!({"a": 1})).unwrap(), "{\"a\":1}");
        assert_eq!(normalize_arguments(&Value::Null), None);
    }

    #[test]
    fn message_to_openai_includes_tool_call_id_for_tool_role() {
        let msg = Message::tool_result("call_1", "42").unwrap();
        let v = message_to_openai(&msg);
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
    }

    #[test]
    fn default_base_urls_cover_every_openai_family_tag() {
        assert!(default_base_url(BackendTag::Openai).is_some());
        assert!(default_base_url(BackendTag::Groq).is_some());
        assert!(default_base_url(BackendTag::Generic).is_none());
    }
}
