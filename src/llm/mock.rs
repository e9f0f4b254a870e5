//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序返回预置响应：complete 弹出 completions 队列，
//! select_tool 弹出 selections 队列；队列耗尽返回 Llm 错误，方便定位脚本不足。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::traits::{LlmClient, Message, ToolDef, ToolSelection};

/// 脚本化 Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    completions: Mutex<VecDeque<String>>,
    selections: Mutex<VecDeque<ToolSelection>>,
    /// 记录每次 select_tool 收到的工具名，用于断言传参
    pub seen_tool_names: Mutex<Vec<Vec<String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, text: impl Into<String>) {
        self.completions.lock().unwrap().push_back(text.into());
    }

    pub fn push_selection(&self, selection: ToolSelection) {
        self.selections.lock().unwrap().push_back(selection);
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, AgentError> {
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Llm("mock completions exhausted".to_string()))
    }

    async fn select_tool(
        &self,
        _messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<ToolSelection, AgentError> {
        self.seen_tool_names
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.selections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Llm("mock selections exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_order() {
        let mock = MockLlmClient::new();
        mock.push_completion("first");
        mock.push_completion("second");
        mock.push_selection(ToolSelection::Call {
            name: "turn_on".to_string(),
            arguments: json!({"entity_id": "light.living_room_1"}),
        });

        assert_eq!(mock.complete(&[], 0.0, 16).await.unwrap(), "first");
        assert_eq!(mock.complete(&[], 0.0, 16).await.unwrap(), "second");
        assert!(mock.complete(&[], 0.0, 16).await.is_err());

        match mock.select_tool(&[], &[]).await.unwrap() {
            ToolSelection::Call { name, .. } => assert_eq!(name, "turn_on"),
            ToolSelection::Text(_) => panic!("expected a call"),
        }
    }
}
