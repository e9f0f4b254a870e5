//! 决策后端抽象
//!
//! Router 只依赖两个能力：complete（文本补全，用于计划生成/修订）与
//! select_tool（工具选择，返回结构化调用或表示"无动作"的纯文本）。
//! 任何同时实现这两个操作的后端都可以替换，Router 无需改动。

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 对话消息
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 传给工具选择操作的工具定义（function calling 格式的最小子集）
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// 输入参数 JSON Schema
    pub parameters: Value,
}

/// 工具选择结果：结构化调用，或纯文本（表示无合适工具 / 目标已完成）
#[derive(Debug, Clone)]
pub enum ToolSelection {
    Call { name: String, arguments: Value },
    Text(String),
}

/// 决策后端 trait：文本补全与工具选择
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 文本补全（非流式）
    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AgentError>;

    /// 工具选择：给出消息与工具目录，返回一次结构化调用或纯文本
    async fn select_tool(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<ToolSelection, AgentError>;
}
