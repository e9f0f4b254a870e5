//! 控制平面与任务层错误类型
//!
//! 传播策略：连接/调用类错误在 ServerConnection 边界被捕获并转为扁平的
//! ToolOutcome（success=false），不会以错误形式抛给 Executor；
//! Router 无可选工具不是错误（RouterDecision.tool = None），只有重试耗尽才让任务进入 Failed。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（连接、路由、工具调用、配置等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 握手失败、连接超时或健康检查连续失败达到阈值
    #[error("Connection error ({server_id}): {reason}")]
    Connection { server_id: String, reason: String },

    /// 引用的 server_id 不在连接池中
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// 远端工具返回失败或响应格式不合法
    #[error("Tool invocation failed ({tool}): {reason}")]
    ToolInvocation { tool: String, reason: String },

    /// 任务重试次数耗尽
    #[error("Task retry exhausted after {retries} attempts: {last_error}")]
    RetryExhausted { retries: u32, last_error: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 任务被取消
    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 便捷构造：连接错误
    pub fn connection(server_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            server_id: server_id.into(),
            reason: reason.into(),
        }
    }

    /// 便捷构造：工具调用错误
    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolInvocation {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = AgentError::connection("home-assistant", "handshake timeout after 10s");
        assert!(e.to_string().contains("home-assistant"));

        let e = AgentError::ServerNotFound("nas".to_string());
        assert_eq!(e.to_string(), "Server not found: nas");
    }
}
