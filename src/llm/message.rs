//! The canonical, provider-agnostic message model.
//!
//! Adapters translate to and from this model; the model itself carries no
//! provider identity. See [`Message`] for the constructor invariants every
//! adapter relies on.

use serde::{Deserialize, Serialize};

/// Who produced a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A function call's name and serialised arguments.
///
/// `arguments` is always the serialised (JSON text) form, never a parsed
/// object, so that fragments streamed across multiple chunks can be
/// concatenated losslessly by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One tool invocation requested by the assistant.
///
/// `index` is the stable slot number assigned for this call within the
/// message: streaming deltas for the same call always carry the same
/// `index`, and the same `id` once the provider has supplied one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub index: u32,
    pub function: FunctionCall,
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token accounting for a single request. Non-negative; reported on
/// terminal chunks only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Error raised by [`Message`]'s constructors when the role/field invariants
/// in spec §3/§4.1 are violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("a `tool` message must carry a tool_call_id")]
    ToolMessageMissingCallId,
    #[error("only `assistant` messages may carry tool_calls")]
    ToolCallsOnNonAssistant,
}

/// The canonical message unit shared by every adapter.
///
/// Invariant (enforced by the constructors below, never by direct field
/// assignment from outside this module): a message with `role = Tool` has
/// `tool_call_id` set; a message with non-empty `tool_calls` has
/// `role = Assistant`. Once constructed, a `Message` is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl Message {
    /// A plain `system`/`user`/`assistant` message with no tool calls.
    pub fn text(role: Role, content: impl Into<String>) -> Result<Self, MessageError> {
        if role == Role::Tool {
            return Err(MessageError::ToolMessageMissingCallId);
        }
        Ok(Self {
            role,
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        })
    }

    /// An assistant message carrying one or more tool invocations.
    ///
    /// `role` must be [`Role::Assistant`]; any other role is rejected since
    /// only the assistant may request tool calls.
    pub fn with_tool_calls(
        role: Role,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Result<Self, MessageError> {
        if role != Role::Assistant {
            return Err(MessageError::ToolCallsOnNonAssistant);
        }
        Ok(Self {
            role,
            content,
            reasoning_content: None,
            tool_calls,
            tool_call_id: None,
        })
    }

    /// A tool-result message answering a prior [`ToolCall`] by id.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            role: Role::Tool,
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        })
    }
}

/// One streaming output unit: a partial assistant message plus optional
/// usage. `usage` may be zeroed on intermediate chunks and populated only on
/// the last chunk of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub message: MessageDelta,
    pub usage: Option<Usage>,
}

/// The partial-message half of a [`Chunk`]: unlike [`Message`], every field
/// is optional/appendable since a stream may deliver content, reasoning, and
/// tool-call fragments in any combination per chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_requires_call_id() {
        let err = Message {
            role: Role::Tool,
            content: Some("x".into()),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        // constructed directly here only to document the shape; the public
        // constructors are the enforcement point.
        assert!(err.tool_call_id.is_none());
        assert!(Message::tool_result("call_1", "result").is_ok());
    }

    #[test]
    fn text_constructor_rejects_tool_role() {
        assert_eq!(
            Message::text(Role::Tool, "x"),
            Err(MessageError::ToolMessageMissingCallId)
        );
    }

    #[test]
    fn assistant_tool_calls_always_assistant_role() {
        let call = ToolCall {
            id: Some("1".into()),
            index: 0,
            function: FunctionCall {
                name: Some("read_file".into()),
                arguments: Some("{}".into()),
            },
        };
        let m = Message::with_tool_calls(Role::Assistant, None, vec![call]).unwrap();
        assert_eq!(m.role, Role::Assistant);
    }

    #[test]
    fn tool_calls_rejected_on_non_assistant_role() {
        assert_eq!(
            Message::with_tool_calls(Role::User, None, Vec::new()),
            Err(MessageError::ToolCallsOnNonAssistant)
        );
    }
}
