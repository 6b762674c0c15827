//! OpenAI-compatible chat completions client. Most hosted LLM APIs follow
//! the same `/v1/chat/completions` format, so a single implementation covers
//! OpenAI, OpenRouter, Groq, Mistral and friends.

use crate::providers::{
    sanitize_api_error, ChatMessage, ChatResponse, Provider, TokenUsage, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub struct OpenAiCompatibleProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!("Failed to build timeout client: {error}");
                Client::new()
            });
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        }
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Deserialize)]
struct ApiChatResponse {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

fn to_tool_payload(spec: &ToolSpec) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

fn parse_tool_call(raw: &serde_json::Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = function
        .get("arguments")
        .and_then(|a| a.as_str())
        .unwrap_or("{}")
        .to_string();
    let id = raw
        .get("id")
        .and_then(|i| i.as_str())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    Some(ToolCall {
        id,
        name,
        arguments,
        raw: raw.clone(),
    })
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<ChatResponse> {
        let tool_payloads: Vec<serde_json::Value> = tools.iter().map(to_tool_payload).collect();
        let request = ApiChatRequest {
            model,
            messages,
            temperature,
            tool_choice: if tool_payloads.is_empty() {
                None
            } else {
                Some("auto")
            },
            tools: if tool_payloads.is_empty() {
                None
            } else {
                Some(tool_payloads)
            },
        };

        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
            anyhow::bail!("Provider API error ({status}): {}", sanitize_api_error(&body));
        }

        let api: ApiChatResponse = response.json().await?;
        let usage = api.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });
        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Provider returned no choices"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .iter()
            .filter_map(parse_tool_call)
            .collect::<Vec<_>>();
        let text = choice.message.content.filter(|c| !c.trim().is_empty());

        Ok(ChatResponse {
            text,
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let p = OpenAiCompatibleProvider::new("https://api.openai.com/v1/", "sk-test", 30);
        assert_eq!(
            p.chat_completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn tool_payload_uses_function_shape() {
        let spec = ToolSpec {
            name: "schedule_followup".into(),
            description: "Schedule a follow-up".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let payload = to_tool_payload(&spec);
        assert_eq!(payload["type"], "function");
        assert_eq!(payload["function"]["name"], "schedule_followup");
    }

    #[test]
    fn parse_tool_call_extracts_fields() {
        let raw = serde_json::json!({
            "id": "call_abc",
            "type": "function",
            "function": {"name": "schedule_followup", "arguments": "{\"delay_minutes\":60}"}
        });
        let call = parse_tool_call(&raw).unwrap();
        assert_eq!(call.id, "call_abc");
        assert_eq!(call.name, "schedule_followup");
        assert!(call.arguments.contains("delay_minutes"));
    }

    #[test]
    fn parse_tool_call_without_function_is_none() {
        assert!(parse_tool_call(&serde_json::json!({"id": "x"})).is_none());
    }
}
