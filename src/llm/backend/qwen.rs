//! The Qwen-Code adapter (C7): an OpenAI-shaped `/chat/completions` body
//! whose content stream interleaves `<think>...</think>` inline reasoning,
//! authenticated via either Qwen CLI OAuth or a static API key.
//!
//! Grounded on `original_source/revibe/core/llm/backend/qwen/handler.py`
//! for the exact wire/auth/thinking-parser semantics, and on
//! `clients/openai.rs` for the host crate's adapter struct/trait-impl shape.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::adapter::{Adapter, ChunkStream, ToolChoice};
use crate::llm::config::{ModelConfig, ProviderConfig};
use crate::llm::error::{BackendError, ErrorContext};
use crate::llm::http::{build_client, DEFAULT_REQUEST_TIMEOUT};
use crate::llm::message::{AvailableTool, Chunk, FunctionCall, Message, MessageDelta, Role, ToolCall, Usage};
use crate::llm::oauth::qwen::{resolve_base_url, QwenOAuthManager, QWEN_DEFAULT_BASE_URL};
use crate::llm::streaming::{decode_json_frame, frame_error, is_event_stream, parse_sse_field, split_sse_lines, ThinkingBlockParser};

/// Either auth path coexists (spec §4.7): a static key takes priority when
/// the provider config supplies one, otherwise OAuth.
enum Auth {
    ApiKey(String),
    OAuth(QwenOAuthManager),
}

pub struct QwenAdapter {
    configured_api_base: Option<String>,
    auth: Auth,
    http: reqwest::Client,
}

impl QwenAdapter {
    pub fn new(provider: &ProviderConfig, oauth_path: std::path::PathBuf) -> Result<Self, BackendError> {
        let api_key = provider
            .api_key_env_var
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        let auth = match api_key {
            Some(key) => Auth::ApiKey(key),
            None => Auth::OAuth(QwenOAuthManager::new(oauth_path)?),
        };

        let http = build_client(DEFAULT_REQUEST_TIMEOUT)
            .map_err(|e| BackendError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            configured_api_base: provider.api_base.clone(),
            auth,
            http,
        })
    }

    /// Test-only constructor wiring a pre-built OAuth manager (typically one
    /// built via [`QwenOAuthManager::new_with_refresh_url`]) directly, so the
    /// auth-retry-exactly-once property (spec testable property 7, scenario
    /// S4) can be exercised against local mock servers instead of DashScope.
    #[cfg(test)]
    pub(crate) fn new_with_oauth_manager(api_base: String, manager: QwenOAuthManager) -> Result<Self, BackendError> {
        let http = build_client(DEFAULT_REQUEST_TIMEOUT)
            .map_err(|e| BackendError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            configured_api_base: Some(api_base),
            auth: Auth::OAuth(manager),
            http,
        })
    }

    /// Resolves `(bearer_token, base_url)` for this request, per spec §4.7:
    /// a static key always pairs with the provider's configured base (or the
    /// DashScope default); OAuth resolves the base from the credentials'
    /// `resource_url`, the provider config, or the default, in that order.
    async fn auth_and_base(&self, force_refresh: bool) -> Result<(String, String), BackendError> {
        match &self.auth {
            Auth::ApiKey(key) => {
                let base = self
                    .configured_api_base
                    .clone()
                    .unwrap_or_else(|| QWEN_DEFAULT_BASE_URL.to_string());
                Ok((key.clone(), base.trim_end_matches('/').to_string()))
            }
            Auth::OAuth(manager) => {
                let info = manager.ensure_authenticated(force_refresh).await?;
                let base = resolve_base_url(info.resource_url.as_deref(), self.configured_api_base.as_deref());
                Ok((info.access_token, base))
            }
        }
    }

    fn ctx(&self, endpoint: &str, model: &str) -> ErrorContext {
        ErrorContext {
            provider: "qwen".into(),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            status: None,
            body_excerpt: None,
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
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
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

    async fn post(
        &self,
        url: &str,
        body: &Value,
        extra_headers: Option<&[(String, String)]>,
        access_token: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(headers) = extra_headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        builder.send().await
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

fn normalize_arguments(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_tool_calls(value: &Value) -> Vec<ToolCall> {
    value
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
        .unwrap_or_default()
}

/// Runs raw `content` through the thinking-block parser (spec §4.7). Always
/// goes through the FSM rather than guarding on whether this particular
/// fragment contains a complete tag: a fragment can hold only half of
/// `<think>` or `</think>` at a streaming chunk boundary, and the FSM's own
/// partial-tag retention is what makes that case correct. An un-reasoning
/// fragment simply comes back unchanged as `content`.
fn split_thinking_blocks(parser: &mut ThinkingBlockParser, content: &str) -> (String, String) {
    parser.push(content)
}

#[async_trait]
impl Adapter for QwenAdapter {
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
        self.complete_with_retry(model, messages, temperature, tools, max_tokens, tool_choice, extra_headers, false)
            .await
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
        let model_name = model.name.clone();
        let body = self.build_body(model, messages, temperature, tools, max_tokens, tool_choice, true);

        let (access_token, base) = self.auth_and_base(false).await?;
        let url = format!("{}/chat/completions", base);
        let response = self
            .post(&url, &body, extra_headers, &access_token)
            .await
            .map_err(|e| BackendError::transport(self.ctx(&url, &model_name), e))?;

        let (response, url) = if matches!(&self.auth, Auth::OAuth(_)) && response.status().as_u16() == 401 {
            let (access_token, base) = self.auth_and_base(true).await?;
            let url = format!("{}/chat/completions", base);
            let response = self
                .post(&url, &body, extra_headers, &access_token)
                .await
                .map_err(|e| BackendError::transport(self.ctx(&url, &model_name), e))?;
            (response, url)
        } else {
            (response, url)
        };

        self.stream_response(response, url, model_name).await
    }

    async fn list_models(&self) -> Vec<String> {
        // Qwen-Code has no models-listing endpoint (spec §4.7 supplement);
        // degrade to an empty catalogue rather than failing or guessing.
        Vec::new()
    }

    fn backend_name(&self) -> &'static str {
        "qwen"
    }
}

impl QwenAdapter {
    #[allow(clippy::too_many_arguments)]
    async fn complete_with_retry(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        extra_headers: Option<&[(String, String)]>,
        force_refresh: bool,
    ) -> Result<Chunk, BackendError> {
        let (access_token, base) = self.auth_and_base(force_refresh).await?;
        let url = format!("{}/chat/completions", base);
        let body = self.build_body(model, messages, temperature, tools, max_tokens, tool_choice, false);

        let response = self
            .post(&url, &body, extra_headers, &access_token)
            .await
            .map_err(|e| BackendError::transport(self.ctx(&url, &model.name), e))?;

        let status = response.status();
        if !force_refresh && matches!(&self.auth, Auth::OAuth(_)) && status.as_u16() == 401 {
            return Box::pin(self.complete_with_retry(
                model, messages, temperature, tools, max_tokens, tool_choice, extra_headers, true,
            ))
            .await;
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), self.ctx(&url, &model.name), Some(body_text)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::transport(self.ctx(&url, &model.name), e))?;

        let choice = &body["choices"][0];
        let message = &choice["message"];
        let raw_content = message["content"].as_str().unwrap_or("");
        let mut native_reasoning = message["reasoning_content"].as_str().map(str::to_string);

        let mut parser = ThinkingBlockParser::new();
        let (content, thinking) = split_thinking_blocks(&mut parser, raw_content);
        if native_reasoning.is_none() && !thinking.is_empty() {
            native_reasoning = Some(thinking);
        }

        let usage = body.get("usage").map(|u| Usage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(Chunk {
            message: MessageDelta {
                content: if content.is_empty() { None } else { Some(content) },
                reasoning_content: native_reasoning,
                tool_calls: parse_tool_calls(&message["tool_calls"]),
                finish_reason: choice["finish_reason"].as_str().map(str::to_string),
            },
            usage,
        })
    }

    async fn stream_response<'a>(
        &'a self,
        response: reqwest::Response,
        url: String,
        model_name: String,
    ) -> Result<ChunkStream<'a>, BackendError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !status.is_success() || !is_event_stream(&content_type) {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), self.ctx(&url, &model_name), Some(body_text)));
        }

        let ctx = self.ctx(&url, &model_name);
        let stream = sse_to_chunks(response.bytes_stream(), ctx);
        Ok(Box::pin(stream))
    }
}

/// Turns the raw SSE byte stream into decoded [`Chunk`]s, applying the
/// cumulative-content detection and thinking-block parser across the whole
/// stream (spec §4.7: some deployments resend the full content so far on
/// every frame rather than a true delta).
fn sse_to_chunks(
    byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ctx: ErrorContext,
) -> impl Stream<Item = Result<Chunk, BackendError>> + Send + 'static {
    async_stream::stream! {
        futures_util::pin_mut!(byte_stream);
        let mut pending = String::new();
        let mut parser = ThinkingBlockParser::new();
        let mut full_content = String::new();

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
                let finish_reason = frame["choices"][0]["finish_reason"].as_str().map(str::to_string);
                let tool_calls = parse_tool_calls(&delta["tool_calls"]);
                let usage = frame.get("usage").map(|u| Usage {
                    prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                    completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
                });

                let mut content = None;
                let mut reasoning_content = delta["reasoning_content"].as_str().map(str::to_string);

                if let Some(new_text) = delta["content"].as_str() {
                    let fragment = if let Some(suffix) = new_text.strip_prefix(full_content.as_str()) {
                        suffix
                    } else {
                        new_text
                    };
                    full_content.push_str(fragment);

                    if !fragment.is_empty() {
                        let (c, r) = split_thinking_blocks(&mut parser, fragment);
                        if !c.is_empty() {
                            content = Some(c);
                        }
                        if reasoning_content.is_none() && !r.is_empty() {
                            reasoning_content = Some(r);
                        }
                    }
                }

                if content.is_some() || reasoning_content.is_some() || !tool_calls.is_empty()
                    || finish_reason.is_some() || usage.is_some()
                {
                    yield Ok(Chunk {
                        message: MessageDelta {
                            content,
                            reasoning_content,
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
