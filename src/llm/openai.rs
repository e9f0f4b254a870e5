//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 工具选择走同一端点的 /chat/completions，直接携带 tools 字段，
//! 按 function calling 响应解析 tool_calls。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::traits::{LlmClient, Message, Role, ToolDef, ToolSelection};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI 兼容客户端：complete 用 async_openai，select_tool 直接发 JSON 请求
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let api_base = base_url.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/').to_string();

        let config = OpenAIConfig::new()
            .with_api_base(&api_base)
            .with_api_key(&api_key);

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Llm(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client: Client::with_config(config),
            http,
            api_base,
            api_key,
            model: model.to_string(),
        })
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, AgentError> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| AgentError::Llm(e.to_string()))?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| AgentError::Llm(e.to_string()))?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| AgentError::Llm(e.to_string()))?,
                    ),
                };
                Ok(msg)
            })
            .collect()
    }

    fn messages_json(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect()
    }

    fn tools_json(tools: &[ToolDef]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AgentError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .temperature(temperature)
            .max_tokens(max_tokens)
            .build()
            .map_err(|e| AgentError::Llm(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }

    async fn select_tool(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<ToolSelection, AgentError> {
        let body = json!({
            "model": self.model,
            "messages": Self::messages_json(messages),
            "tools": Self::tools_json(tools),
            "tool_choice": "auto",
        });

        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("chat completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!(
                "chat completion returned {}: {}",
                status, text
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AgentError::JsonParse(e.to_string()))?;

        let message = payload
            .pointer("/choices/0/message")
            .ok_or_else(|| AgentError::JsonParse("response has no choices".to_string()))?;

        // 优先解析 tool_calls；没有时降级为纯文本
        if let Some(call) = message.pointer("/tool_calls/0/function") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::JsonParse("tool call has no name".to_string()))?
                .to_string();
            let raw_args = call.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments: Value = serde_json::from_str(raw_args)
                .map_err(|e| AgentError::JsonParse(format!("tool arguments: {}", e)))?;
            return Ok(ToolSelection::Call { name, arguments });
        }

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ToolSelection::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tools_json_shape() {
        let tools = vec![ToolDef {
            name: "turn_on".to_string(),
            description: "打开设备".to_string(),
            parameters: json!({"type": "object", "properties": {"entity_id": {"type": "string"}}}),
        }];
        let rendered = OpenAiClient::tools_json(&tools);
        assert_eq!(rendered[0]["type"], "function");
        assert_eq!(rendered[0]["function"]["name"], "turn_on");
        assert!(rendered[0]["function"]["parameters"]["properties"]["entity_id"].is_object());
    }

    #[test]
    fn test_messages_json_roles() {
        let messages = vec![
            Message::system("你是路由器"),
            Message::user("开灯"),
            Message::assistant("好的"),
        ];
        let rendered = OpenAiClient::messages_json(&messages);
        assert_eq!(rendered[0]["role"], "system");
        assert_eq!(rendered[1]["role"], "user");
        assert_eq!(rendered[2]["role"], "assistant");
    }
}
