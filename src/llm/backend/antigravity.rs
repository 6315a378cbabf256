//! The Antigravity adapter (C6): Google's Gemini-family gateway wire
//! format — `contents`/`parts`, `functionDeclarations`,
//! `streamGenerateContent?alt=sse` — rather than OpenAI's `/chat/completions`
//! shape.
//!
//! Grounded entirely on `original_source/revibe/core/llm/backend/
//! antigravity/__init__.py` (the host crate has no native Gemini-wire
//! client; `clients/gemini.rs` there is itself OpenAI-compatible), using the
//! host crate's `async_trait`/owned-`reqwest::Client` adapter shape to
//! express it idiomatically.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::adapter::{Adapter, ChunkStream, ToolChoice};
use crate::llm::config::ModelConfig;
use crate::llm::error::{BackendError, ErrorContext};
use crate::llm::http::{build_client, DEFAULT_REQUEST_TIMEOUT};
use crate::llm::message::{AvailableTool, Chunk, FunctionCall, Message, MessageDelta, Role, ToolCall, Usage};
use crate::llm::oauth::antigravity::AntigravityOAuthManager;
use crate::llm::streaming::{decode_json_frame, frame_error, is_event_stream, parse_sse_field, split_sse_lines, ToolCallIndexTracker};

/// Default Antigravity gateway endpoint (spec §4.6); a model-agnostic base
/// that `:generateContent`/`:streamGenerateContent` are appended to.
pub const ANTIGRAVITY_DEFAULT_ENDPOINT: &str =
    "https://antigravity.googleapis.com/v1internal/models";

/// Retryable statuses: 401 always, 403 too since Antigravity's gateway
/// returns it for expired scopes as well (spec §4.6).
fn is_retryable_status(status: u16) -> bool {
    status == 401 || status == 403
}

pub struct AntigravityAdapter {
    endpoint: String,
    oauth: AntigravityOAuthManager,
    http: reqwest::Client,
}

impl AntigravityAdapter {
    pub fn new(
        oauth_path: std::path::PathBuf,
        default_project_id: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self, BackendError> {
        let http = build_client(DEFAULT_REQUEST_TIMEOUT)
            .map_err(|e| BackendError::config(format!("failed to build HTTP client: {}", e)))?;
        let oauth = AntigravityOAuthManager::new(oauth_path, default_project_id)?;
        Ok(Self {
            endpoint: endpoint.unwrap_or_else(|| ANTIGRAVITY_DEFAULT_ENDPOINT.to_string()),
            oauth,
            http,
        })
    }

    /// Test-only constructor wiring a pre-built OAuth manager (typically one
    /// built via [`AntigravityOAuthManager::new_with_refresh_url`]) directly,
    /// so the auth-retry-exactly-once property (spec testable property 7,
    /// scenario S5) can be exercised against local mock servers.
    #[cfg(test)]
    pub(crate) fn new_with_oauth_manager(endpoint: String, oauth: AntigravityOAuthManager) -> Result<Self, BackendError> {
        let http = build_client(DEFAULT_REQUEST_TIMEOUT)
            .map_err(|e| BackendError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { endpoint, oauth, http })
    }

    fn ctx(&self, endpoint: &str, model: &str) -> ErrorContext {
        ErrorContext {
            provider: "antigravity".into(),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            status: None,
            body_excerpt: None,
        }
    }

    fn build_payload(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        project_id: Option<&str>,
    ) -> Value {
        let mut generation_config = json!({ "temperature": temperature });
        if let Some(max_tokens) = max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }

        let call_names = tool_call_names(messages);
        let mut request_body = json!({
            "contents": messages.iter().map(|m| message_to_contents_entry(m, &call_names)).collect::<Vec<_>>(),
            "generationConfig": generation_config,
        });
        if let Some(tools) = tools {
            request_body["tools"] = json!([{ "functionDeclarations": tools_to_declarations(tools) }]);
        }
        if let Some(choice) = tool_choice {
            request_body["toolConfig"] = json!({ "functionCallingConfig": choice.to_gemini_value() });
        }

        let mut payload = json!({
            "model": model.name,
            "userAgent": "antigravity",
            "requestId": format!("py-{}", random_hex_16()),
            "request": request_body,
        });
        if let Some(project_id) = project_id {
            if !project_id.is_empty() {
                payload["project"] = json!(project_id);
            }
        }
        payload
    }
}

/// A `requestId` suffix in the shape the gateway expects: 16 hex chars.
/// Drawn from the OAuth PKCE RNG rather than a second source, since both
/// only need non-predictable bytes, not cryptographic uniqueness guarantees
/// beyond "don't collide with a concurrent request."
fn random_hex_16() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Maps each assistant-issued tool call id to the function name it invoked,
/// so a later tool-result message can recover the name `functionResponse`
/// needs (the canonical `Message` only stores `tool_call_id` on the result,
/// per `examples/original_source/revibe/core/llm/backend/antigravity/__init__.py:163-178`
/// where the name comes from the call itself, not the result).
fn tool_call_names(messages: &[Message]) -> std::collections::HashMap<&str, &str> {
    let mut names = std::collections::HashMap::new();
    for msg in messages {
        for tc in &msg.tool_calls {
            names.insert(tc.id.as_str(), tc.function.name.as_str());
        }
    }
    names
}

/// Every non-assistant role collapses to `"user"`; only `assistant` becomes
/// `"model"` (spec §4.6).
fn message_to_contents_entry(msg: &Message, call_names: &std::collections::HashMap<&str, &str>) -> Value {
    let role = if msg.role == Role::Assistant { "model" } else { "user" };
    let mut parts = Vec::new();
    if msg.role != Role::Tool {
        if let Some(content) = &msg.content {
            if !content.is_empty() {
                parts.push(json!({ "text": content }));
            }
        }
    }
    if msg.role == Role::Tool {
        if let Some(call_id) = &msg.tool_call_id {
            let name = call_names.get(call_id.as_str()).copied().unwrap_or(call_id.as_str());
            parts.push(json!({
                "functionResponse": {
                    "name": name,
                    "response": { "result": msg.content.clone().unwrap_or_default() },
                },
            }));
        }
    }
    for tc in &msg.tool_calls {
        parts.push(json!({
            "functionCall": {
                "name": tc.function.name,
                "args": tc.function.arguments.as_deref()
                    .and_then(|a| serde_json::from_str::<Value>(a).ok())
                    .unwrap_or(Value::Null),
            },
        }));
    }
    json!({ "role": role, "parts": parts })
}

/// Compiles tool parameter schemas to `{type: object, properties, required}`
/// per spec §4.6; nested schemas pass through verbatim under each property.
fn tools_to_declarations(tools: &[AvailableTool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut decl = json!({
                "name": tool.name,
                "description": tool.description,
            });
            let props = tool.parameters.get("properties").cloned().unwrap_or_else(|| json!({}));
            let required = tool.parameters.get("required").cloned().unwrap_or_else(|| json!([]));
            decl["parameters"] = json!({
                "type": "object",
                "properties": props,
                "required": required,
            });
            decl
        })
        .collect()
}

/// Extracts `(content, reasoning_content, tool_calls)` from one
/// `response.candidates[0].content.parts[]` array, assigning stable
/// name-keyed indices via `tracker` (spec §4.6, testable property 6).
fn parts_to_delta(parts: &[Value], tracker: &mut ToolCallIndexTracker) -> (Option<String>, Option<String>, Vec<ToolCall>) {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if is_thought {
                reasoning.push_str(text);
            } else {
                content.push_str(text);
            }
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            let arguments = Some(args.to_string());
            let index = tracker.index_for(&name);
            tool_calls.push(ToolCall {
                id: None,
                index,
                function: FunctionCall { name: Some(name), arguments },
            });
        }
    }

    (
        if content.is_empty() { None } else { Some(content) },
        if reasoning.is_empty() { None } else { Some(reasoning) },
        tool_calls,
    )
}

fn candidate_parts(body: &Value) -> &[Value] {
    body.get("response")
        .unwrap_or(body)
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn usage_from_body(body: &Value) -> Option<Usage> {
    let usage = body.get("response").unwrap_or(body).get("usageMetadata")?;
    Some(Usage {
        prompt_tokens: usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
        completion_tokens: usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
    })
}

#[async_trait]
impl Adapter for AntigravityAdapter {
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
        let url = format!("{}/{}:streamGenerateContent", self.endpoint, model.name);

        let response = self
            .post_with_retry(&url, model, messages, temperature, tools, max_tokens, tool_choice, extra_headers, false, true)
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !status.is_success() || !is_event_stream(&content_type) {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), self.ctx(&url, &model.name), Some(body_text)));
        }

        let ctx = self.ctx(&url, &model.name);
        let stream = sse_to_chunks(response.bytes_stream(), ctx);
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Vec<String> {
        vec![
            "gemini-3-flash".to_string(),
            "gemini-3-pro-low".to_string(),
            "gemini-3-pro-high".to_string(),
            "claude-sonnet-4-5".to_string(),
            "claude-sonnet-4-5-thinking-low".to_string(),
            "claude-sonnet-4-5-thinking-medium".to_string(),
            "claude-sonnet-4-5-thinking-high".to_string(),
            "claude-opus-4-5-thinking-low".to_string(),
            "claude-opus-4-5-thinking-medium".to_string(),
            "claude-opus-4-5-thinking-high".to_string(),
        ]
    }

    fn backend_name(&self) -> &'static str {
        "antigravity"
    }
}

impl AntigravityAdapter {
    #[allow(clippy::too_many_arguments)]
    async fn post_with_retry(
        &self,
        url: &str,
        model: &ModelConfig,
        messages: &[Message],
        temperature: f32,
        tools: Option<&[AvailableTool]>,
        max_tokens: Option<u32>,
        tool_choice: Option<&ToolChoice>,
        extra_headers: Option<&[(String, String)]>,
        force_refresh: bool,
        streaming: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let auth = self.oauth.ensure_authenticated(force_refresh).await?;
        let payload = self.build_payload(model, messages, temperature, tools, max_tokens, tool_choice, auth.project_id.as_deref());

        let mut builder = self.http.post(url);
        if streaming {
            // Only the streamGenerateContent call wants an SSE body; adding
            // this to generateContent makes `response.json()` fail there.
            builder = builder.query(&[("alt", "sse")]);
        }
        let mut builder = builder
            .bearer_auth(&auth.access_token)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(headers) = extra_headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::transport(self.ctx(url, &model.name), e))?;

        let status = response.status();
        if !force_refresh && is_retryable_status(status.as_u16()) {
            return Box::pin(self.post_with_retry(
                url, model, messages, temperature, tools, max_tokens, tool_choice, extra_headers, true, streaming,
            ))
            .await;
        }
        Ok(response)
    }

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
        let url = format!("{}/{}:generateContent", self.endpoint, model.name);
        let response = self
            .post_with_retry(&url, model, messages, temperature, tools, max_tokens, tool_choice, extra_headers, force_refresh, false)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), self.ctx(&url, &model.name), Some(body_text)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::transport(self.ctx(&url, &model.name), e))?;

        let mut tracker = ToolCallIndexTracker::new();
        let (content, reasoning_content, tool_calls) = parts_to_delta(candidate_parts(&body), &mut tracker);
        let usage = usage_from_body(&body);

        Ok(Chunk {
            message: MessageDelta {
                content,
                reasoning_content,
                tool_calls,
                finish_reason: None,
            },
            usage,
        })
    }
}

/// Turns the raw SSE byte stream into decoded [`Chunk`]s, tracking tool-call
/// indices across the whole stream (one tracker per stream, not per frame).
fn sse_to_chunks(
    byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ctx: ErrorContext,
) -> impl Stream<Item = Result<Chunk, BackendError>> + Send + 'static {
    async_stream::stream! {
        futures_util::pin_mut!(byte_stream);
        let mut pending = String::new();
        let mut tracker = ToolCallIndexTracker::new();

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

                let (content, reasoning_content, tool_calls) = parts_to_delta(candidate_parts(&frame), &mut tracker);
                let usage = usage_from_body(&frame);

                if content.is_some() || reasoning_content.is_some() || !tool_calls.is_empty() || usage.is_some() {
                    yield Ok(Chunk {
                        message: MessageDelta {
                            content,
                            reasoning_content,
                            tool_calls,
                            finish_reason: None,
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
    fn message_to_contents_collapses_roles() {
        let user = Message::text(Role::User, "hi").unwrap();
        let system = Message::text(Role::System, "sys").unwrap();
        let assistant = Message::text(Role::Assistant, "hello").unwrap();
        let names = std::collections::HashMap::new();
        assert_eq!(message_to_contents_entry(&user, &names)["role"], "user");
        assert_eq!(message_to_contents_entry(&system, &names)["role"], "user");
        assert_eq!(message_to_contents_entry(&assistant, &names)["role"], "model");
    }

    #[test]
    fn tool_message_emits_only_function_response_with_call_name() {
        let assistant = Message::with_tool_calls(
            Role::Assistant,
            None,
            vec![ToolCall {
                id: "call-1".into(),
                index: 0,
                function: FunctionCall {
                    name: "get_weather".into(),
                    arguments: Some("{}".into()),
                },
            }],
        )
        .unwrap();
        let tool = Message::tool_result("call-1", "72F").unwrap();
        let messages = vec![assistant, tool.clone()];
        let names = tool_call_names(&messages);

        let entry = message_to_contents_entry(&tool, &names);
        let parts = entry["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["functionResponse"]["name"], "get_weather");
        assert_eq!(parts[0]["functionResponse"]["response"]["result"], "72F");
    }

    #[test]
    fn tools_to_declarations_compiles_object_schema() {
        let tool = AvailableTool {
            name: "read_file".into(),
            description: "reads a file".into(),
            parameters: json!({
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        };
        let decls = tools_to_declarations(&[tool]);
        assert_eq!(decls[0]["name"], "read_file");
        assert_eq!(decls[0]["parameters"]["type"], "object");
        assert_eq!(decls[0]["parameters"]["required"][0], "path");
    }

    // Scenario S2: a function call split across frames keeps one stable
    // index across both fragments.
    #[test]
    fn tool_call_split_across_frames_keeps_stable_index() {
        let mut tracker = ToolCallIndexTracker::new();
        let frame1 = json!({
            "candidates": [{"content": {"parts": [
                {"functionCall": {"name": "read_file", "args": {"path": "/a"}}}
            ]}}]
        });
        let frame2 = json!({
            "candidates": [{"content": {"parts": [
                {"functionCall": {"name": "read_file", "args": {"offset": 0}}}
            ]}}]
        });
        let (_, _, calls1) = parts_to_delta(candidate_parts(&frame1), &mut tracker);
        let (_, _, calls2) = parts_to_delta(candidate_parts(&frame2), &mut tracker);
        assert_eq!(calls1[0].index, 0);
        assert_eq!(calls2[0].index, 0);
        assert_eq!(calls1[0].function.arguments.as_deref(), Some("{\"path\":\"/a\"}"));
        assert_eq!(calls2[0].function.arguments.as_deref(), Some("{\"offset\":0}"));
    }

    #[test]
    fn thought_part_goes_to_reasoning_not_content() {
        let mut tracker = ToolCallIndexTracker::new();
        let frame = json!({
            "candidates": [{"content": {"parts": [
                {"thought": true, "text": "thinking..."},
                {"text": "answer"}
            ]}}]
        });
        let (content, reasoning, _) = parts_to_delta(candidate_parts(&frame), &mut tracker);
        assert_eq!(content.as_deref(), Some("answer"));
        assert_eq!(reasoning.as_deref(), Some("thinking..."));
    }

    #[test]
    fn usage_extracted_from_wrapped_response() {
        let body = json!({
            "response": {
                "candidates": [{"content": {"parts": []}}],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5},
            }
        });
        let usage = usage_from_body(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }

    use crate::llm::oauth::antigravity::AntigravityCredentials;
    use crate::llm::oauth::{atomic_write_json, now_epoch_secs};
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_refresh_server(hits: Arc<AtomicUsize>) -> String {
        let app = axum::Router::new().route(
            "/token",
            axum::routing::post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({
                        "access_token": "refreshed-token",
                        "expires_in": 3600,
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}/token", addr)
    }

    /// Provider mock that 403s on the first hit (Antigravity's gateway uses
    /// 403 for expired scopes, spec §4.6) and succeeds from the second hit.
    async fn spawn_provider_server(hits: Arc<AtomicUsize>) -> String {
        let app = axum::Router::new().route(
            "/test-model:generateContent",
            axum::routing::post(move || {
                let hits = hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        (axum::http::StatusCode::FORBIDDEN, "forbidden").into_response()
                    } else {
                        axum::Json(json!({
                            "response": {
                                "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
                                "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1},
                            }
                        }))
                        .into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    async fn spawn_always_403_server(hits: Arc<AtomicUsize>) -> String {
        let app = axum::Router::new().route(
            "/test-model:generateContent",
            axum::routing::post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (axum::http::StatusCode::FORBIDDEN, "forbidden")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    /// A manager whose cached token looks locally valid, so only the
    /// adapter's forced retry after an upstream 403 can trigger a refresh.
    async fn locally_valid_creds_manager(refresh_url: String) -> AntigravityOAuthManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let creds = AntigravityCredentials {
            access_token: "locally-valid-but-revoked".into(),
            refresh_token: "rt".into(),
            expires_at: now_epoch_secs() + 3600,
            project_id: Some("proj-1".into()),
        };
        atomic_write_json(&path, &creds).await.unwrap();
        AntigravityOAuthManager::new_with_refresh_url(path, None, refresh_url).unwrap()
    }

    fn test_model() -> ModelConfig {
        ModelConfig::new("test-model", "antigravity", None, 0.2)
    }

    // Scenario S5 / property 7: a 403 triggers exactly one forced refresh and
    // exactly one retried provider request, then succeeds.
    #[tokio::test]
    async fn complete_retries_once_after_403_then_succeeds() {
        let refresh_hits = Arc::new(AtomicUsize::new(0));
        let refresh_url = spawn_refresh_server(refresh_hits.clone()).await;
        let provider_hits = Arc::new(AtomicUsize::new(0));
        let provider_endpoint = spawn_provider_server(provider_hits.clone()).await;

        let oauth = locally_valid_creds_manager(refresh_url).await;
        let adapter = AntigravityAdapter::new_with_oauth_manager(provider_endpoint, oauth).unwrap();
        let model = test_model();
        let messages = [Message::text(Role::User, "hi").unwrap()];

        let chunk = adapter
            .complete(&model, &messages, 0.2, None, None, None, None)
            .await
            .unwrap();

        assert_eq!(chunk.message.content.as_deref(), Some("hi"));
        assert_eq!(provider_hits.load(Ordering::SeqCst), 2);
        assert_eq!(refresh_hits.load(Ordering::SeqCst), 1);
    }

    // Property 7, failure half: a provider that 403s twice in a row
    // surfaces `AuthError` after exactly two upstream requests.
    #[tokio::test]
    async fn complete_surfaces_auth_error_after_second_403() {
        let refresh_hits = Arc::new(AtomicUsize::new(0));
        let refresh_url = spawn_refresh_server(refresh_hits.clone()).await;
        let provider_hits = Arc::new(AtomicUsize::new(0));
        let provider_endpoint = spawn_always_403_server(provider_hits.clone()).await;

        let oauth = locally_valid_creds_manager(refresh_url).await;
        let adapter = AntigravityAdapter::new_with_oauth_manager(provider_endpoint, oauth).unwrap();
        let model = test_model();
        let messages = [Message::text(Role::User, "hi").unwrap()];

        let err = adapter
            .complete(&model, &messages, 0.2, None, None, None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::AuthError { .. }));
        assert_eq!(provider_hits.load(Ordering::SeqCst), 2);
    }
}
