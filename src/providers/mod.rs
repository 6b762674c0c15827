//! AI provider abstraction. One implementation today (OpenAI-compatible chat
//! completions), behind a trait so the dispatch worker never cares which API
//! is on the other end.

use crate::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai;

pub use openai::OpenAiCompatibleProvider;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn that requested tool calls; the raw call payloads ride
    /// along so the follow-up request replays valid history.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<serde_json::Value>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.unwrap_or_default(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// The provider's raw call object, replayed verbatim in history.
    pub raw: serde_json::Value,
}

/// Raw token counts from a single API response.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A model response that may contain text, tool calls, or both.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Tool definition in the OpenAI function-calling shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// One request against the conversation; tools may be empty.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<ChatResponse>;
}

/// Build the configured provider, or `None` when no API key is set (AI
/// generation disabled, canned follow-up text only).
pub fn provider_from_config(config: &Config) -> Option<Box<dyn Provider>> {
    let api_key = config.provider.api_key.as_deref()?.trim();
    if api_key.is_empty() {
        return None;
    }
    Some(Box::new(OpenAiCompatibleProvider::new(
        &config.provider.api_url,
        api_key,
        config.provider.request_timeout_secs,
    )))
}

const MAX_API_ERROR_CHARS: usize = 400;

/// Truncate provider error bodies so auth tokens or giant payloads never end
/// up in logs or the DB.
pub fn sanitize_api_error(input: &str) -> String {
    if input.chars().count() <= MAX_API_ERROR_CHARS {
        return input.to_string();
    }
    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_roles() {
        assert_eq!(ChatMessage::system("x").role, "system");
        assert_eq!(ChatMessage::user("x").role, "user");
        assert_eq!(ChatMessage::assistant("x").role, "assistant");
        let tool = ChatMessage::tool_result("call_1", "ok");
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn sanitize_api_error_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let out = sanitize_api_error(&long);
        assert!(out.len() < long.len());
        assert!(out.ends_with("..."));
        assert_eq!(sanitize_api_error("short"), "short");
    }

    #[test]
    fn provider_disabled_without_api_key() {
        let mut config = Config::default();
        config.provider.api_key = None;
        assert!(provider_from_config(&config).is_none());
        config.provider.api_key = Some("   ".into());
        assert!(provider_from_config(&config).is_none());
        config.provider.api_key = Some("sk-test".into());
        assert!(provider_from_config(&config).is_some());
    }
}
