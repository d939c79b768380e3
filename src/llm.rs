// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The LLM capability interface.
//!
//! The core depends on exactly one model capability: chat with optional tool
//! calls. Providers implement [`ChatModel`]; everything else (endpoints,
//! credentials, sampling) lives in [`LlmSettings`] on the agent descriptor
//! and is the provider's business. Context-window overflows must surface as
//! [`crate::Error::ContextLimit`] so the agent loop can run its trim
//! recovery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::messages::{Message, ToolCall};

/// A tool made visible to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as the model should emit it.
    pub name: String,
    /// What the tool does and when to use it.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
}

/// The model's reply to a chat call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant text content.
    pub content: String,
    /// Tool calls requested by the model, in emission order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    /// A plain text reply with no tool calls.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// A reply requesting tool calls.
    #[must_use]
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }

    /// Whether the reply completes the loop (no tool calls).
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// LLM endpoint configuration carried by an agent descriptor.
///
/// Credential fields arrive pre-interpolated from the configuration loader;
/// the core only reads the named environment variable when a provider client
/// is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL of the chat endpoint.
    pub endpoint: String,
    /// Model identifier.
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: String,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "default".to_string(),
            api_key_env: String::new(),
            temperature: None,
        }
    }
}

/// Chat with optional tool calls, the only dependency on any LLM service.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one chat completion over `messages` with `tools` visible.
    async fn chat(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<ChatResponse>;

    /// Provider label for logging.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// A scriptable chat model for tests and offline runs.
///
/// Replies are popped from a queue; an empty queue yields a terminal
/// `"done"` reply. An optional context window makes the model reject
/// prompts of that many messages or more with a context-limit error, and an
/// optional per-call delay simulates latency.
#[derive(Default)]
pub struct ScriptedChatModel {
    responses: Mutex<VecDeque<ChatResponse>>,
    context_window: Option<usize>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedChatModel {
    /// A model with no scripted replies (always answers `"done"`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply.
    #[must_use]
    pub fn with_response(self, response: ChatResponse) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
        self
    }

    /// Queue several replies in order.
    #[must_use]
    pub fn with_responses(self, responses: impl IntoIterator<Item = ChatResponse>) -> Self {
        {
            let mut queue = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            queue.extend(responses);
        }
        self
    }

    /// Reject prompts with `window` or more messages as over the limit.
    #[must_use]
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = Some(window);
        self
    }

    /// Sleep this long before every reply.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of chat calls made so far.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn chat(&self, messages: &[Message], _tools: &[ToolDefinition]) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(window) = self.context_window {
            if messages.len() >= window {
                return Err(Error::ContextLimit {
                    reason: format!("{} messages >= window of {window}", messages.len()),
                });
            }
        }

        let mut queue = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(queue.pop_front().unwrap_or_else(|| ChatResponse::text("done")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

impl std::fmt::Debug for ScriptedChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedChatModel")
            .field("context_window", &self.context_window)
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_model_pops_replies_in_order() {
        let model = ScriptedChatModel::new()
            .with_response(ChatResponse::text("first"))
            .with_response(ChatResponse::text("second"));

        let reply = model.chat(&[], &[]).await.unwrap();
        assert_eq!(reply.content, "first");
        let reply = model.chat(&[], &[]).await.unwrap();
        assert_eq!(reply.content, "second");
        // Exhausted queue falls back to a terminal reply.
        let reply = model.chat(&[], &[]).await.unwrap();
        assert_eq!(reply.content, "done");
        assert!(reply.is_final());
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn context_window_raises_context_limit() {
        let model = ScriptedChatModel::new().with_context_window(3);
        let messages = vec![
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
        ];
        let err = model.chat(&messages, &[]).await.unwrap_err();
        assert!(matches!(err, Error::ContextLimit { .. }));

        // Under the window it succeeds.
        let reply = model.chat(&messages[..2], &[]).await.unwrap();
        assert!(reply.is_final());
    }

    #[test]
    fn final_detection_is_tool_call_absence_only() {
        assert!(ChatResponse::text("anything at all").is_final());
        let call = ToolCall::new("search", serde_json::Map::new());
        assert!(!ChatResponse::with_tool_calls("", vec![call]).is_final());
    }

    #[test]
    fn tool_definition_round_trips() {
        let def = ToolDefinition {
            name: "calc".to_string(),
            description: "arithmetic".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let json = serde_json::to_string(&def).unwrap();
        let restored: ToolDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(def, restored);
    }
}
