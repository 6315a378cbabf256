//! Shared streaming primitives (C9): SSE line/field decoding, JSON frame
//! parsing, the Qwen thinking-block state machine, and the Gemini tool-call
//! index tracker. These are used by every adapter rather than
//! re-implemented per adapter.

use std::collections::HashMap;

use crate::llm::error::{BackendError, ErrorContext};

/// Splits a byte buffer into `\n`-terminated lines, stripping a trailing
/// `\r`. The final, possibly-incomplete line (no trailing `\n` yet) is
/// returned separately so the caller can prepend it to the next read.
pub fn split_sse_lines(buf: &str) -> (Vec<&str>, &str) {
    let mut lines = Vec::new();
    let mut rest = buf;
    while let Some(idx) = rest.find('\n') {
        let mut line = &rest[..idx];
        if let Some(stripped) = line.strip_suffix('\r') {
            line = stripped;
        }
        lines.push(line);
        rest = &rest[idx + 1..];
    }
    (lines, rest)
}

/// Parses one SSE line into a `(field, value)` pair. Lines with no colon are
/// ignored by the caller unless they decode as standalone JSON (error
/// envelopes some gateways send outside the `data:` field).
pub fn parse_sse_field(line: &str) -> Option<(&str, &str)> {
    if line.trim().is_empty() {
        return None;
    }
    let colon = line.find(':')?;
    let field = line[..colon].trim();
    let mut value = &line[colon + 1..];
    if let Some(stripped) = value.strip_prefix(' ') {
        value = stripped;
    }
    Some((field, value))
}

/// Best-effort JSON frame decode. Malformed frames are the caller's
/// responsibility to drop with a debug log; this just reports the fact.
pub fn decode_json_frame(value: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(value) {
        Ok(v) => Some(v),
        Err(e) => {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!(target: "llm::streaming", "dropping malformed SSE frame: {}", e);
            }
            None
        }
    }
}

/// Raised when a decoded frame carries a top-level `{"error": ...}` payload.
pub fn frame_error(frame: &serde_json::Value, ctx: ErrorContext) -> Option<BackendError> {
    let error = frame.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown upstream error")
        .to_string();
    let status = error.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16;
    Some(if (400..500).contains(&status) {
        BackendError::BadRequestError {
            ctx: with_excerpt(ctx, message),
        }
    } else {
        BackendError::ServerError {
            ctx: with_excerpt(ctx, message),
        }
    })
}

fn with_excerpt(mut ctx: ErrorContext, message: String) -> ErrorContext {
    ctx.body_excerpt = Some(message);
    ctx
}

/// Guards that a response actually declares SSE framing. If not, the body
/// should be read fully and surfaced as a `PayloadError` (or the embedded
/// API error message, if the body is JSON).
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim() == "text/event-stream")
        .unwrap_or(false)
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkState {
    Outside,
    Inside,
}

/// Incremental parser for Qwen's inline `<think>...</think>` reasoning.
///
/// Unlike a naive buffer-and-search implementation, this parser retains a
/// partial tag at a chunk boundary rather than emitting it as content: a
/// chunk ending in `"<thi"` holds those bytes back instead of leaking them
/// into `content`, so concatenating results across arbitrary chunk splits
/// equals parsing the whole input at once (spec testable property 3).
#[derive(Debug, Default)]
pub struct ThinkingBlockParser {
    state: ThinkStateOpt,
    buffer: String,
}

// Wrapper so `Default` doesn't need a manual impl for the plain enum above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThinkStateOpt(ThinkState);
impl Default for ThinkStateOpt {
    fn default() -> Self {
        ThinkStateOpt(ThinkState::Outside)
    }
}

impl ThinkingBlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment of the stream; returns the `(content,
    /// reasoning_content)` deltas extracted so far, withholding any
    /// trailing bytes that might still be the start of a tag.
    pub fn push(&mut self, text: &str) -> (String, String) {
        self.buffer.push_str(text);
        let mut content = String::new();
        let mut reasoning = String::new();

        loop {
            match self.state.0 {
                ThinkState::Inside => {
                    if let Some(idx) = self.buffer.find(THINK_CLOSE) {
                        reasoning.push_str(&self.buffer[..idx]);
                        self.buffer = self.buffer[idx + THINK_CLOSE.len()..].to_string();
                        self.state.0 = ThinkState::Outside;
                    } else {
                        let hold = longest_tag_prefix_suffix(&self.buffer, THINK_CLOSE);
                        let split = self.buffer.len() - hold;
                        reasoning.push_str(&self.buffer[..split]);
                        self.buffer = self.buffer[split..].to_string();
                        break;
                    }
                }
                ThinkState::Outside => {
                    if let Some(idx) = self.buffer.find(THINK_OPEN) {
                        content.push_str(&self.buffer[..idx]);
                        self.buffer = self.buffer[idx + THINK_OPEN.len()..].to_string();
                        self.state.0 = ThinkState::Inside;
                    } else {
                        let hold = longest_tag_prefix_suffix(&self.buffer, THINK_OPEN);
                        let split = self.buffer.len() - hold;
                        content.push_str(&self.buffer[..split]);
                        self.buffer = self.buffer[split..].to_string();
                        break;
                    }
                }
            }
        }

        (content, reasoning)
    }
}

/// Returns the length of the longest proper suffix of `buf` that is also a
/// proper prefix of `tag` (i.e. `buf` might end mid-tag). Zero if no such
/// overlap exists.
fn longest_tag_prefix_suffix(buf: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buf.len());
    for k in (1..=max).rev() {
        if buf.ends_with(&tag[..k]) {
            return k;
        }
    }
    0
}

/// Assigns stable, monotonically-increasing indices to Gemini function
/// calls by name, since the Antigravity wire format never supplies an
/// index: the first fragment carrying a given name claims the next free
/// index; every later fragment with that name reuses it (spec §4.6,
/// testable property 6).
#[derive(Debug, Default)]
pub struct ToolCallIndexTracker {
    index_by_name: HashMap<String, u32>,
    next_index: u32,
}

impl ToolCallIndexTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_for(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.index_by_name.get(name) {
            return *idx;
        }
        let idx = self.next_index;
        self.index_by_name.insert(name.to_string(), idx);
        self.next_index += 1;
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_line_split_handles_crlf_and_partial_tail() {
        let (lines, rest) = split_sse_lines("data: a\r\ndata: b\nincomplete");
        assert_eq!(lines, vec!["data: a", "data: b"]);
        assert_eq!(rest, "incomplete");
    }

    #[test]
    fn sse_field_parse_strips_leading_space() {
        assert_eq!(parse_sse_field("data: hello"), Some(("data", "hello")));
        assert_eq!(parse_sse_field("data:hello"), Some(("data", "hello")));
        assert_eq!(parse_sse_field(""), None);
    }

    #[test]
    fn content_type_guard_requires_exact_mime() {
        assert!(is_event_stream("text/event-stream"));
        assert!(is_event_stream("text/event-stream; charset=utf-8"));
        assert!(!is_event_stream("application/json"));
    }

    #[test]
    fn malformed_json_frame_is_dropped_not_fatal() {
        assert!(decode_json_frame("{not json").is_none());
        assert!(decode_json_frame("{\"a\":1}").is_some());
    }

    // Scenario S3.
    #[test]
    fn thinking_parser_handles_inline_split_across_tags() {
        let mut p = ThinkingBlockParser::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        for chunk in ["A<thi", "nk>B</thi", "nk>C"] {
            let (c, r) = p.push(chunk);
            content.push_str(&c);
            reasoning.push_str(&r);
        }
        assert_eq!(content, "AC");
        assert_eq!(reasoning, "B");
    }

    // Property 3: idempotence under arbitrary splitting.
    #[test]
    fn thinking_parser_idempotent_under_arbitrary_splits() {
        let whole = "before <think>reasoning here</think> after <think>more</think> tail";

        let mut one_shot = ThinkingBlockParser::new();
        let (c_whole, r_whole) = one_shot.push(whole);

        for split_at in 1..whole.len() {
            if !whole.is_char_boundary(split_at) {
                continue;
            }
            let (a, b) = whole.split_at(split_at);
            let mut p = ThinkingBlockParser::new();
            let (c1, r1) = p.push(a);
            let (c2, r2) = p.push(b);
            assert_eq!(format!("{}{}", c1, c2), c_whole, "split at {}", split_at);
            assert_eq!(format!("{}{}", r1, r2), r_whole, "split at {}", split_at);
        }
    }

    #[test]
    fn thinking_parser_byte_by_byte_split() {
        let whole = "x<think>y</think>z";
        let mut p = ThinkingBlockParser::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        for ch in whole.chars() {
            let (c, r) = p.push(&ch.to_string());
            content.push_str(&c);
            reasoning.push_str(&r);
        }
        assert_eq!(content, "xz");
        assert_eq!(reasoning, "y");
    }

    // Scenario S2 / property 6.
    #[test]
    fn tool_call_index_tracker_assigns_stable_indices_by_name() {
        let mut tracker = ToolCallIndexTracker::new();
        assert_eq!(tracker.index_for("read_file"), 0);
        assert_eq!(tracker.index_for("write_file"), 1);
        assert_eq!(tracker.index_for("read_file"), 0);
        assert_eq!(tracker.index_for("read_file"), 0);
        assert_eq!(tracker.index_for("search"), 2);
    }
}
